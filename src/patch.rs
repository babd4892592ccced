//! Per-request accumulation of RFC6902 JSON Patch operations.

use json_patch::{AddOperation, PatchOperation};
use jsonptr::{Pointer, PointerBuf};
use serde_json::Value;

/// Builds a JSON Pointer from unescaped reference tokens.
///
/// Tokens containing `/` or `~` (annotation keys, for instance) are escaped.
pub fn pointer<I, T>(tokens: I) -> PointerBuf
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    PointerBuf::from_tokens(tokens.into_iter().map(|t| t.as_ref().to_string()))
}

/// Ordered, append-only list of patch operations scoped to a single request.
///
/// Nothing is deduplicated or reordered. Callers check the object they are
/// mutating before appending, so that re-running a rule on an already
/// patched object adds nothing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PatchSet {
    ops: Vec<PatchOperation>,
}

impl PatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_patch(&mut self, op: PatchOperation) {
        self.ops.push(op);
    }

    /// Appends an `add` of `value` at `path`.
    pub fn add(&mut self, path: PointerBuf, value: Value) {
        self.add_patch(PatchOperation::Add(AddOperation { path, value }));
    }

    /// Appends an `add` to the end of the array at `array_path` (`<array_path>/-`).
    ///
    /// The array must already exist when the patch is applied; add the whole
    /// array at `array_path` instead when it may be absent.
    pub fn append(&mut self, array_path: &Pointer, value: Value) {
        let mut path = array_path.to_buf();
        path.push_back("-");
        self.add(path, value);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatchOperation> {
        self.ops.iter()
    }

    pub fn as_slice(&self) -> &[PatchOperation] {
        &self.ops
    }

    /// Serializes the operations as a JSON array, the body of a `JSONPatch`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.ops)
    }
}
