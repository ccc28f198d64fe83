use crate::central::Central;
use crate::characteristic::CharacteristicId;

/// Identifies one read request or one batch of write requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Read,
    Write,
}

/// A read or write request received from a central.
///
/// Every request delivered to the delegate must be answered exactly once with
/// [`PeripheralManager::respond_to_request()`](crate::PeripheralManager::respond_to_request).
/// All requests of one write batch share an [`id()`](AttRequest::id) and are answered together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttRequest {
    id: RequestId,
    kind: RequestKind,
    central: Central,
    characteristic: CharacteristicId,
    offset: usize,
    value: Vec<u8>,
}

impl AttRequest {
    pub(crate) fn new(
        id: RequestId,
        kind: RequestKind,
        central: Central,
        characteristic: CharacteristicId,
        offset: usize,
        value: Vec<u8>,
    ) -> Self {
        Self {
            id,
            kind,
            central,
            characteristic,
            offset,
            value,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn central(&self) -> &Central {
        &self.central
    }

    pub fn characteristic(&self) -> CharacteristicId {
        self.characteristic
    }

    /// The zero-based offset of the first byte read or written.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// For writes, the bytes the central wants to write. For reads, the bytes that will be sent
    /// back; pre-filled with the stored value starting at [`offset()`](AttRequest::offset).
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Replaces the bytes returned by a read request.
    pub fn set_value(&mut self, value: impl Into<Vec<u8>>) {
        self.value = value.into();
    }
}
