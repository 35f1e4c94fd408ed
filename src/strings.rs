use std::collections::{BTreeSet, HashMap};

use crate::error::BlockError;

/// Interns strings into small integer references.
///
/// Index 0 always holds the empty string, so a zero reference in metadata
/// means "unset".
#[derive(Debug, Clone)]
pub struct StringTable {
    dict: HashMap<String, i32>,
    strings: Vec<String>,
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StringTable {
    pub fn new() -> Self {
        let mut dict = HashMap::new();
        dict.insert(String::new(), 0);
        Self {
            dict,
            strings: vec![String::new()],
        }
    }

    /// Build a table from strings as stored in block metadata.
    ///
    /// The first entry must be the empty string and entries must be unique.
    pub fn from_strings(strings: Vec<String>) -> Option<Self> {
        if strings.first().map(String::as_str) != Some("") {
            return None;
        }
        let mut dict = HashMap::with_capacity(strings.len());
        for (i, s) in strings.iter().enumerate() {
            if dict.insert(s.clone(), i as i32).is_some() {
                return None;
            }
        }
        Some(Self { dict, strings })
    }

    /// Return the reference of `s`, adding it if it has not been seen yet.
    pub fn put(&mut self, s: &str) -> i32 {
        if let Some(&i) = self.dict.get(s) {
            return i;
        }
        let i = self.strings.len() as i32;
        self.strings.push(s.to_string());
        self.dict.insert(s.to_string(), i);
        i
    }

    pub fn lookup(&self, i: i32) -> Option<&str> {
        usize::try_from(i)
            .ok()
            .and_then(|i| self.strings.get(i))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.len() == 1
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn into_strings(self) -> Vec<String> {
        self.strings
    }
}

/// Decode label sets stored in metadata.
///
/// Sets are laid out back to back, each as its pair count followed by the
/// name and value references of every pair.
pub fn label_sets<'a>(
    labels: &[i32],
    strings: &'a [String],
) -> Result<Vec<Vec<(&'a str, &'a str)>>, BlockError> {
    let lookup = |i: i32| {
        usize::try_from(i)
            .ok()
            .and_then(|i| strings.get(i))
            .map(String::as_str)
            .ok_or_else(|| BlockError::corrupted(format!("label reference {i} is out of range")))
    };
    let mut sets = Vec::new();
    let mut rest = labels;
    while let Some((&n, tail)) = rest.split_first() {
        let pairs = usize::try_from(n)
            .ok()
            .and_then(|n| n.checked_mul(2))
            .filter(|&len| len <= tail.len())
            .ok_or_else(|| BlockError::corrupted(format!("malformed label set of {n} pairs")))?;
        let (refs, tail) = tail.split_at(pairs);
        let set = refs
            .chunks_exact(2)
            .map(|pair| Ok((lookup(pair[0])?, lookup(pair[1])?)))
            .collect::<Result<Vec<_>, BlockError>>()?;
        sets.push(set);
        rest = tail;
    }
    Ok(sets)
}

/// Collects distinct label sets and encodes them against a string table.
#[derive(Debug, Clone, Default)]
pub struct LabelBuilder {
    sets: BTreeSet<Vec<(String, String)>>,
}

impl LabelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a label set; pairs are kept sorted by name.
    pub fn add<N, V>(&mut self, pairs: impl IntoIterator<Item = (N, V)>) -> &mut Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        let mut set: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();
        set.sort();
        if !set.is_empty() {
            self.sets.insert(set);
        }
        self
    }

    /// Add the encoded label sets of another block.
    pub fn put(&mut self, labels: &[i32], strings: &[String]) -> Result<(), BlockError> {
        for set in label_sets(labels, strings)? {
            self.add(set);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn build(&self, table: &mut StringTable) -> Vec<i32> {
        let mut labels = Vec::new();
        for set in &self.sets {
            labels.push(set.len() as i32);
            for (name, value) in set {
                labels.push(table.put(name));
                labels.push(table.put(value));
            }
        }
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::{label_sets, LabelBuilder, StringTable};

    #[test]
    fn put_is_idempotent() {
        let mut table = StringTable::new();
        assert_eq!(table.put(""), 0);
        let a = table.put("tenant-a");
        let b = table.put("service");
        assert_eq!(table.put("tenant-a"), a);
        assert_eq!(table.put("service"), b);
        assert_ne!(a, b);
        assert_eq!(table.len(), 3);
        assert_eq!(table.lookup(a), Some("tenant-a"));
        assert_eq!(table.lookup(0), Some(""));
        assert_eq!(table.lookup(-1), None);
        assert_eq!(table.lookup(10), None);
    }

    #[test]
    fn from_strings_validates_layout() {
        assert!(StringTable::from_strings(vec!["a".into()]).is_none());
        assert!(StringTable::from_strings(vec!["".into(), "a".into(), "a".into()]).is_none());

        let mut table = StringTable::from_strings(vec!["".into(), "a".into()]).unwrap();
        assert_eq!(table.put("a"), 1);
        assert_eq!(table.put("b"), 2);
        assert_eq!(table.into_strings(), vec!["", "a", "b"]);
    }

    #[test]
    fn label_sets_are_merged_across_tables() {
        let mut a = StringTable::new();
        let mut builder = LabelBuilder::new();
        builder
            .add([("service_name", "api"), ("__profile_type__", "cpu")])
            .add([("__profile_type__", "cpu"), ("service_name", "api")]);
        let encoded = builder.build(&mut a);
        assert_eq!(encoded.len(), 5);

        let mut merged = LabelBuilder::new();
        merged.put(&encoded, a.strings()).unwrap();
        merged.add([("service_name", "api"), ("__profile_type__", "mem")]);

        let mut b = StringTable::new();
        b.put("unrelated");
        let encoded = merged.build(&mut b);
        let sets = label_sets(&encoded, b.strings()).unwrap();
        assert_eq!(
            sets,
            vec![
                vec![("__profile_type__", "cpu"), ("service_name", "api")],
                vec![("__profile_type__", "mem"), ("service_name", "api")],
            ]
        );
    }

    #[test]
    fn malformed_label_sets() {
        let strings = vec!["".to_string(), "a".to_string()];
        assert!(label_sets(&[], &strings).unwrap().is_empty());
        assert!(label_sets(&[2, 1, 1], &strings).is_err());
        assert!(label_sets(&[1, 1, 7], &strings).is_err());
        assert!(label_sets(&[-1], &strings).is_err());
    }
}
