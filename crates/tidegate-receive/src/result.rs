use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

/// Numeric id of a review record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangeId(pub u32);

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultKey {
    Created,
    Replaced,
    Autoclosed,
}

impl ResultKey {
    pub const ALL: [ResultKey; 3] = [ResultKey::Created, ResultKey::Replaced, ResultKey::Autoclosed];

    pub fn as_str(self) -> &'static str {
        match self {
            ResultKey::Created => "CREATED",
            ResultKey::Replaced => "REPLACED",
            ResultKey::Autoclosed => "AUTOCLOSED",
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    magic_push: bool,
    ids: HashMap<ResultKey, Vec<ChangeId>>,
}

/// Change ids touched by one push, grouped by outcome.
///
/// Filled by the commit processor while it runs; read by the coordinator
/// once waiting is over.
#[derive(Debug, Default)]
pub struct ResultChangeIds {
    inner: Mutex<Inner>,
}

impl ResultChangeIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: ResultKey, id: ChangeId) {
        self.inner.lock().ids.entry(key).or_default().push(id);
    }

    pub fn record(&self, key: ResultKey, ids: impl IntoIterator<Item = ChangeId>) {
        self.inner.lock().ids.entry(key).or_default().extend(ids);
    }

    pub fn get(&self, key: ResultKey) -> Vec<ChangeId> {
        self.inner.lock().ids.get(&key).cloned().unwrap_or_default()
    }

    pub fn count(&self, key: ResultKey) -> usize {
        self.inner.lock().ids.get(&key).map_or(0, Vec::len)
    }

    /// Marks the push as targeting a magic branch even if it ends up
    /// creating or replacing nothing.
    pub fn set_magic_push(&self, magic: bool) {
        self.inner.lock().magic_push = magic;
    }

    pub fn is_magic_push(&self) -> bool {
        let inner = self.inner.lock();
        inner.magic_push
            || [ResultKey::Created, ResultKey::Replaced]
                .iter()
                .any(|key| inner.ids.get(key).is_some_and(|ids| !ids.is_empty()))
    }
}
