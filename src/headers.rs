use std::fmt;

/// Ordered multi-value header store.
///
/// Keys compare case-insensitively and keep the spelling of their first
/// insertion. Every key holds a list of values ordered newest first:
/// [`Headers::set`] prepends, so [`Headers::get`] always returns the value
/// set last while earlier values stay available through
/// [`Headers::get_all`] and [`Headers::joined`].
///
/// The parser fills the store with [`Headers::append`], which keeps wire
/// order, so on a received frame `get` returns the first occurrence on the
/// wire. Marshalling writes values front to back, which makes both rules
/// agree on a round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    name: String,
    values: Vec<String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(key))
    }

    /// Set `key` to `value`, keeping previous values behind it.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        match self.position(&key) {
            Some(i) => self.entries[i].values.insert(0, value.into()),
            None => self.entries.push(Entry {
                name: key,
                values: vec![value.into()],
            }),
        }
    }

    /// Add `value` behind any existing values of `key`.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        match self.position(&key) {
            Some(i) => self.entries[i].values.push(value.into()),
            None => self.entries.push(Entry {
                name: key,
                values: vec![value.into()],
            }),
        }
    }

    /// Current value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.position(key)
            .and_then(|i| self.entries[i].values.first())
            .map(String::as_str)
    }

    /// All values of `key`, newest first.
    pub fn get_all(&self, key: &str) -> &[String] {
        match self.position(key) {
            Some(i) => &self.entries[i].values,
            None => &[],
        }
    }

    /// All values of `key` joined with commas, newest first.
    pub fn joined(&self, key: &str) -> Option<String> {
        self.position(key)
            .map(|i| self.entries[i].values.join(","))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    /// Drop every value of `key`. Returns whether the key was present.
    pub fn remove(&mut self, key: &str) -> bool {
        match self.position(key) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    /// Header names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Every `(name, value)` pair, names in insertion order and values
    /// newest first.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|e| e.values.iter().map(move |v| (e.name.as_str(), v.as_str())))
    }

    /// Every `(name, value)` pair with names sorted lexicographically.
    pub fn sorted(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<&Entry> = self.entries.iter().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
            .into_iter()
            .flat_map(|e| e.values.iter().map(move |v| (e.name.as_str(), v.as_str())))
            .collect()
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in self.sorted() {
            writeln!(f, "{}: {}", k, v)?;
        }
        Ok(())
    }
}
