use uuid::Uuid;

/// A remote central connected to the local peripheral.
///
/// Two `Central`s are equal when their identifiers are equal.
#[derive(Debug, Clone)]
pub struct Central {
    identifier: Uuid,
    max_update_value_len: usize,
}

impl PartialEq for Central {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
    }
}

impl Eq for Central {}

impl std::hash::Hash for Central {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identifier.hash(state);
    }
}

impl Central {
    pub fn new(identifier: Uuid, max_update_value_len: usize) -> Self {
        Central {
            identifier,
            max_update_value_len,
        }
    }

    pub fn identifier(&self) -> Uuid {
        self.identifier
    }

    /// The largest notification payload this central accepts. Longer values are truncated.
    pub fn max_update_value_len(&self) -> usize {
        self.max_update_value_len
    }
}
