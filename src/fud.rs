//! Rules ("fuds"): ordered layers of lookup transforms.
//!
//! Each transform reads byte values of its input variables and produces one
//! derived variable. Inputs are either row features or derived variables of
//! earlier transforms in the same fud.

use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    pub derived: u64,
    pub valency: u16,
    pub inputs: Vec<u64>,
    /// Input tuple to derived value. Unlisted tuples map to 0.
    pub table: BTreeMap<Vec<u8>, u8>,
}

impl Transform {
    pub fn new(derived: u64, valency: u16, inputs: Vec<u64>, table: BTreeMap<Vec<u8>, u8>) -> Self {
        Self { derived, valency, inputs, table }
    }

    pub fn eval(&self, key: &[u8]) -> u8 {
        self.table.get(key).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fud {
    pub transforms: Vec<Transform>,
}

impl Fud {
    pub fn new(transforms: Vec<Transform>) -> Self {
        Self { transforms }
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn derived(&self) -> Vec<u64> {
        self.transforms.iter().map(|t| t.derived).collect()
    }

    /// Inputs that are not derived within this fud.
    pub fn underlying(&self) -> Vec<u64> {
        let derived: HashSet<u64> = self.transforms.iter().map(|t| t.derived).collect();
        let mut out: Vec<u64> = self
            .transforms
            .iter()
            .flat_map(|t| t.inputs.iter().copied())
            .filter(|v| !derived.contains(v))
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Evaluate the transforms in layer order and return the values of
    /// `outputs`. A requested variable this fud does not derive reads 0.
    pub fn apply(&self, lookup: &dyn Fn(u64) -> u8, outputs: &[u64]) -> Vec<u8> {
        let mut derived: HashMap<u64, u8> = HashMap::with_capacity(self.transforms.len());
        let mut key = Vec::new();
        for t in &self.transforms {
            key.clear();
            key.extend(t.inputs.iter().map(|v| derived.get(v).copied().unwrap_or_else(|| lookup(*v))));
            derived.insert(t.derived, t.eval(&key));
        }
        outputs.iter().map(|v| derived.get(v).copied().unwrap_or(0)).collect()
    }

    /// Keep only the transforms `outputs` depend on.
    pub fn depends(&self, outputs: &[u64]) -> Fud {
        let by_derived: HashMap<u64, &Transform> = self.transforms.iter().map(|t| (t.derived, t)).collect();
        let mut keep: HashSet<u64> = HashSet::new();
        let mut stack: Vec<u64> = outputs.to_vec();
        while let Some(v) = stack.pop() {
            if let Some(t) = by_derived.get(&v) {
                if keep.insert(v) {
                    stack.extend(t.inputs.iter().copied());
                }
            }
        }
        Fud::new(
            self.transforms
                .iter()
                .filter(|t| keep.contains(&t.derived))
                .cloned()
                .collect(),
        )
    }

    /// Rename derived variables, and inputs that refer to them.
    pub fn remap(&self, map: &HashMap<u64, u64>) -> Fud {
        let derived: HashSet<u64> = self.transforms.iter().map(|t| t.derived).collect();
        let rename = |v: u64| if derived.contains(&v) { map.get(&v).copied().unwrap_or(v) } else { v };
        Fud::new(
            self.transforms
                .iter()
                .map(|t| Transform {
                    derived: rename(t.derived),
                    valency: t.valency,
                    inputs: t.inputs.iter().map(|v| rename(*v)).collect(),
                    table: t.table.clone(),
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold(derived: u64, input: u64) -> Transform {
        let mut table = BTreeMap::new();
        table.insert(vec![1], 1);
        Transform::new(derived, 2, vec![input], table)
    }

    #[test]
    fn test_apply_layers() {
        let mut and = BTreeMap::new();
        and.insert(vec![1, 1], 1);
        let fud = Fud::new(vec![threshold(100, 1), threshold(101, 2), Transform::new(102, 2, vec![100, 101], and)]);
        let lookup = |v: u64| match v {
            1 => 1,
            2 => 1,
            _ => 0,
        };
        assert_eq!(fud.apply(&lookup, &[102, 100]), vec![1, 1]);
        let lookup = |v: u64| if v == 1 { 1 } else { 0 };
        assert_eq!(fud.apply(&lookup, &[102]), vec![0]);
        assert_eq!(fud.underlying(), vec![1, 2]);
    }

    #[test]
    fn test_depends_prunes() {
        let fud = Fud::new(vec![threshold(100, 1), threshold(101, 2), threshold(102, 100)]);
        let pruned = fud.depends(&[102]);
        assert_eq!(pruned.derived(), vec![100, 102]);
    }

    #[test]
    fn test_remap_renames_internal_inputs() {
        let fud = Fud::new(vec![threshold(5, 1), threshold(6, 5)]);
        let map: HashMap<u64, u64> = [(5, 500), (6, 600)].into_iter().collect();
        let r = fud.remap(&map);
        assert_eq!(r.derived(), vec![500, 600]);
        assert_eq!(r.transforms[1].inputs, vec![500]);
        assert_eq!(r.transforms[0].inputs, vec![1]);
    }
}
