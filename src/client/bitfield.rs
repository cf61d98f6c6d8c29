use super::types::Bitfield;

/// Unpacks a wire bitfield, dropping the spare bits of the last byte or
/// padding a short payload with zeros so it covers exactly `piece_count`.
pub fn from_payload(payload: &[u8], piece_count: usize) -> Bitfield {
    let mut bitfield = Bitfield::from_slice(payload);
    bitfield.resize(piece_count, false);
    bitfield
}

/// Returns false when `index` is outside the bitfield.
pub fn set_piece(bitfield: &mut Bitfield, index: usize) -> bool {
    if index >= bitfield.len() {
        return false;
    }
    bitfield.set(index, true);
    true
}
