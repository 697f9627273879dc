use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

/// A point on the identifier circle. Node ids and key ids share this space.
pub type ChordId = u32;

/// The exponent m of the key space: ids live in `[0, 2^m)`.
pub const KEY_BITS: u32 = 32;

/// The highest possible id on the circle.
pub const fn highest_id() -> ChordId {
	ChordId::MAX
}

/// Hashes a value to its key id, `hash(bytes) mod 2^m`.
///
/// Every node in the ring must agree on this function: the default hasher
/// is keyed with fixed constants, so nodes built from the same toolchain
/// hash identically.
pub fn key_of(data: &[u8]) -> ChordId {
	let mut hasher = DefaultHasher::new();
	hasher.write(data);
	hasher.finish() as ChordId
}

/// Tests if `id` lies in the cyclic interval `(lower, upper]`.
///
/// With `lower == upper` the interval is the single point `lower`.
pub fn is_between(id: ChordId, lower: ChordId, upper: ChordId) -> bool {
	match lower.cmp(&upper) {
		Ordering::Less => id > lower && id <= upper,
		Ordering::Equal => id == lower,
		Ordering::Greater => id > lower || id <= upper,
	}
}
