//! Multiset hash digests, combined as an additive commutative monoid.
//!
//! A digest commits to a multiset of rows. The union of two multisets hashes to the sum of their
//! digests, and the empty multiset hashes to zero, so digests can be folded in any order.

use plonky2::field::extension::Extendable;
use plonky2::field::types::Field;
use plonky2::hash::hash_types::RichField;
use plonky2::iop::target::Target;
use plonky2::plonk::circuit_builder::CircuitBuilder;

pub const MULTISET_HASH_WIDTH: usize = 8;

pub type MultisetHash<T> = [T; MULTISET_HASH_WIDTH];

pub fn empty_multiset_hash<F: Field>() -> MultisetHash<F> {
    [F::ZERO; MULTISET_HASH_WIDTH]
}

pub fn is_empty_multiset_hash<F: Field>(hash: &MultisetHash<F>) -> bool {
    hash.iter().all(|x| x.is_zero())
}

pub fn combine_multiset_hash<F: Field>(
    a: &MultisetHash<F>,
    b: &MultisetHash<F>,
) -> MultisetHash<F> {
    core::array::from_fn(|i| a[i] + b[i])
}

pub trait CircuitBuilderMultisetHash<F: RichField + Extendable<D>, const D: usize> {
    fn combine_multiset_hash(
        &mut self,
        a: &MultisetHash<Target>,
        b: &MultisetHash<Target>,
    ) -> MultisetHash<Target>;
}

impl<F: RichField + Extendable<D>, const D: usize> CircuitBuilderMultisetHash<F, D>
    for CircuitBuilder<F, D>
{
    fn combine_multiset_hash(
        &mut self,
        a: &MultisetHash<Target>,
        b: &MultisetHash<Target>,
    ) -> MultisetHash<Target> {
        core::array::from_fn(|i| self.add(a[i], b[i]))
    }
}
