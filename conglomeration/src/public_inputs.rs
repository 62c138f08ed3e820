use anyhow::{ensure, Result};
use plonky2::field::extension::{Extendable, FieldExtension};
use plonky2::field::types::Field;
use plonky2::hash::hash_types::{HashOut, RichField, NUM_HASH_OUT_ELTS};
use plonky2::iop::ext_target::ExtensionTarget;
use plonky2::iop::target::Target;
use plonky2::iop::witness::{PartialWitness, WitnessWrite};
use plonky2::plonk::circuit_builder::CircuitBuilder;
use serde::{Deserialize, Serialize};

use crate::multiset::{combine_multiset_hash, empty_multiset_hash, MultisetHash, MULTISET_HASH_WIDTH};
use crate::segment::SegmentKind;
use crate::vk_tree::VerifyingKey;

/// Everything a segment or conglomeration proof exposes to the proof that folds it.
///
/// `T` is the base value (a field element out of circuit, a [`Target`] in circuit) and `E` the
/// extension value used by the three lookup/permutation accumulators.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicInputBundle<T, E> {
    pub functionals: Vec<T>,
    /// Per module. Identical on every proof of a run.
    pub target_segment_count: Vec<T>,
    /// Per module. Number of GL segments aggregated below this proof.
    pub segment_count_gl: Vec<T>,
    /// Per module. Number of LPP segments aggregated below this proof.
    pub segment_count_lpp: Vec<T>,
    pub general_multiset_hash: MultisetHash<T>,
    pub shared_randomness_multiset_hash: MultisetHash<T>,
    pub vkey_merkle_root: [T; NUM_HASH_OUT_ELTS],
    pub verifying_key: [[T; NUM_HASH_OUT_ELTS]; 2],
    pub log_derivative_sum: E,
    pub horner_sum: E,
    pub grand_product: E,
    /// All zero while unset.
    pub shared_randomness: [T; NUM_HASH_OUT_ELTS],
}

pub type PublicInputValues<F, const D: usize> =
    PublicInputBundle<F, <F as Extendable<D>>::Extension>;

pub type PublicInputTargets<const D: usize> = PublicInputBundle<Target, ExtensionTarget<D>>;

/// Lengths of the variable-size parts of a bundle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleShape {
    pub num_functionals: usize,
    pub num_modules: usize,
}

impl BundleShape {
    pub const fn new(num_functionals: usize, num_modules: usize) -> Self {
        Self {
            num_functionals,
            num_modules,
        }
    }

    /// Number of base elements in a flattened bundle.
    pub const fn num_elements<const D: usize>(&self) -> usize {
        self.num_functionals
            + 3 * self.num_modules
            + 2 * MULTISET_HASH_WIDTH
            + 3 * NUM_HASH_OUT_ELTS
            + 3 * D
            + NUM_HASH_OUT_ELTS
    }
}

struct Cursor<'a, T> {
    rest: &'a [T],
}

impl<'a, T: Copy> Cursor<'a, T> {
    fn take(&mut self, n: usize) -> Result<&'a [T]> {
        ensure!(self.rest.len() >= n, "public input bundle is truncated");
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    fn take_vec(&mut self, n: usize) -> Result<Vec<T>> {
        Ok(self.take(n)?.to_vec())
    }

    fn take_array<const N: usize>(&mut self) -> Result<[T; N]> {
        let head = self.take(N)?;
        Ok(core::array::from_fn(|i| head[i]))
    }
}

impl<T: Copy, E: Copy> PublicInputBundle<T, E> {
    pub fn shape(&self) -> BundleShape {
        BundleShape::new(self.functionals.len(), self.target_segment_count.len())
    }

    fn flatten_with<const D: usize>(&self, ext: impl Fn(E) -> [T; D]) -> Vec<T> {
        let mut out = Vec::with_capacity(self.shape().num_elements::<D>());
        out.extend_from_slice(&self.functionals);
        out.extend_from_slice(&self.target_segment_count);
        out.extend_from_slice(&self.segment_count_gl);
        out.extend_from_slice(&self.segment_count_lpp);
        out.extend_from_slice(&self.general_multiset_hash);
        out.extend_from_slice(&self.shared_randomness_multiset_hash);
        out.extend_from_slice(&self.vkey_merkle_root);
        out.extend_from_slice(&self.verifying_key[0]);
        out.extend_from_slice(&self.verifying_key[1]);
        out.extend(ext(self.log_derivative_sum));
        out.extend(ext(self.horner_sum));
        out.extend(ext(self.grand_product));
        out.extend_from_slice(&self.shared_randomness);
        out
    }

    fn rebuild_with<const D: usize>(
        shape: BundleShape,
        elements: &[T],
        ext: impl Fn([T; D]) -> E,
    ) -> Result<Self> {
        ensure!(
            elements.len() == shape.num_elements::<D>(),
            "expected {} public inputs, got {}",
            shape.num_elements::<D>(),
            elements.len()
        );
        let mut cur = Cursor { rest: elements };
        Ok(Self {
            functionals: cur.take_vec(shape.num_functionals)?,
            target_segment_count: cur.take_vec(shape.num_modules)?,
            segment_count_gl: cur.take_vec(shape.num_modules)?,
            segment_count_lpp: cur.take_vec(shape.num_modules)?,
            general_multiset_hash: cur.take_array()?,
            shared_randomness_multiset_hash: cur.take_array()?,
            vkey_merkle_root: cur.take_array()?,
            verifying_key: [cur.take_array()?, cur.take_array()?],
            log_derivative_sum: ext(cur.take_array()?),
            horner_sum: ext(cur.take_array()?),
            grand_product: ext(cur.take_array()?),
            shared_randomness: cur.take_array()?,
        })
    }

    pub fn segment_counts(&self, kind: SegmentKind) -> &[T] {
        match kind {
            SegmentKind::Gl => &self.segment_count_gl,
            SegmentKind::Lpp => &self.segment_count_lpp,
            SegmentKind::Conglomeration => &[],
        }
    }
}

impl<F: RichField, E: Field> PublicInputBundle<F, E> {
    /// A bundle that is neutral for every aggregated channel.
    pub fn identity(shape: BundleShape) -> Self {
        Self {
            functionals: vec![F::ZERO; shape.num_functionals],
            target_segment_count: vec![F::ZERO; shape.num_modules],
            segment_count_gl: vec![F::ZERO; shape.num_modules],
            segment_count_lpp: vec![F::ZERO; shape.num_modules],
            general_multiset_hash: empty_multiset_hash(),
            shared_randomness_multiset_hash: empty_multiset_hash(),
            vkey_merkle_root: [F::ZERO; NUM_HASH_OUT_ELTS],
            verifying_key: [[F::ZERO; NUM_HASH_OUT_ELTS]; 2],
            log_derivative_sum: E::ZERO,
            horner_sum: E::ZERO,
            grand_product: E::ONE,
            shared_randomness: [F::ZERO; NUM_HASH_OUT_ELTS],
        }
    }

    pub fn to_field_elements<const D: usize>(&self) -> Vec<F>
    where
        E: FieldExtension<D, BaseField = F>,
    {
        self.flatten_with::<D>(|e| <E as FieldExtension<D>>::to_basefield_array(&e))
    }

    pub fn from_field_elements<const D: usize>(shape: BundleShape, elements: &[F]) -> Result<Self>
    where
        E: FieldExtension<D, BaseField = F>,
    {
        Self::rebuild_with::<D>(shape, elements, <E as FieldExtension<D>>::from_basefield_array)
    }

    pub fn vkey_merkle_root(&self) -> HashOut<F> {
        HashOut {
            elements: self.vkey_merkle_root,
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey<F> {
        self.verifying_key.map(|elements| HashOut { elements })
    }

    pub fn set_verifying_key(&mut self, vk: &VerifyingKey<F>) {
        self.verifying_key = vk.map(|h| h.elements);
    }

    pub fn shared_randomness(&self) -> HashOut<F> {
        HashOut {
            elements: self.shared_randomness,
        }
    }

    /// Number of segments of `kind` aggregated below this bundle. Saturates at `u64::MAX`.
    pub fn segment_total(&self, kind: SegmentKind) -> u64 {
        self.segment_counts(kind)
            .iter()
            .fold(0u64, |total, c| total.saturating_add(c.to_canonical_u64()))
    }

    /// Public inputs of the proof folding `a` and `b`.
    ///
    /// Additive channels are summed, the grand product is multiplied, the run-wide constants are
    /// taken from `a`, and each element of the shared randomness comes from whichever child has it
    /// set.
    pub fn conglomerate(a: &Self, b: &Self, conglomeration_vk: &VerifyingKey<F>) -> Self {
        let add = |x: &[F], y: &[F]| x.iter().zip(y).map(|(&x, &y)| x + y).collect::<Vec<_>>();
        Self {
            functionals: add(&a.functionals, &b.functionals),
            target_segment_count: a.target_segment_count.clone(),
            segment_count_gl: add(&a.segment_count_gl, &b.segment_count_gl),
            segment_count_lpp: add(&a.segment_count_lpp, &b.segment_count_lpp),
            general_multiset_hash: combine_multiset_hash(
                &a.general_multiset_hash,
                &b.general_multiset_hash,
            ),
            shared_randomness_multiset_hash: combine_multiset_hash(
                &a.shared_randomness_multiset_hash,
                &b.shared_randomness_multiset_hash,
            ),
            vkey_merkle_root: a.vkey_merkle_root,
            verifying_key: conglomeration_vk.map(|h| h.elements),
            log_derivative_sum: a.log_derivative_sum + b.log_derivative_sum,
            horner_sum: a.horner_sum + b.horner_sum,
            grand_product: a.grand_product * b.grand_product,
            shared_randomness: core::array::from_fn(|i| {
                if a.shared_randomness[i].is_zero() {
                    b.shared_randomness[i]
                } else {
                    a.shared_randomness[i]
                }
            }),
        }
    }
}

fn virtual_array<F: RichField + Extendable<D>, const D: usize, const N: usize>(
    builder: &mut CircuitBuilder<F, D>,
) -> [Target; N] {
    core::array::from_fn(|_| builder.add_virtual_target())
}

impl<const D: usize> PublicInputBundle<Target, ExtensionTarget<D>> {
    pub fn add_virtual<F: RichField + Extendable<D>>(
        builder: &mut CircuitBuilder<F, D>,
        shape: BundleShape,
    ) -> Self {
        Self {
            functionals: builder.add_virtual_targets(shape.num_functionals),
            target_segment_count: builder.add_virtual_targets(shape.num_modules),
            segment_count_gl: builder.add_virtual_targets(shape.num_modules),
            segment_count_lpp: builder.add_virtual_targets(shape.num_modules),
            general_multiset_hash: virtual_array(builder),
            shared_randomness_multiset_hash: virtual_array(builder),
            vkey_merkle_root: virtual_array(builder),
            verifying_key: [virtual_array(builder), virtual_array(builder)],
            log_derivative_sum: builder.add_virtual_extension_target(),
            horner_sum: builder.add_virtual_extension_target(),
            grand_product: builder.add_virtual_extension_target(),
            shared_randomness: virtual_array(builder),
        }
    }

    pub fn to_targets(&self) -> Vec<Target> {
        self.flatten_with::<D>(|e| e.to_target_array())
    }

    pub fn from_targets(shape: BundleShape, targets: &[Target]) -> Result<Self> {
        Self::rebuild_with::<D>(shape, targets, ExtensionTarget)
    }

    pub fn register_public_inputs<F: RichField + Extendable<D>>(
        &self,
        builder: &mut CircuitBuilder<F, D>,
    ) {
        builder.register_public_inputs(&self.to_targets());
    }

    pub fn set_witness<F: RichField + Extendable<D>>(
        &self,
        pw: &mut PartialWitness<F>,
        values: &PublicInputValues<F, D>,
    ) -> Result<()> {
        ensure!(
            self.shape() == values.shape(),
            "bundle shape mismatch: {:?} vs {:?}",
            self.shape(),
            values.shape()
        );
        for (t, v) in self.to_targets().into_iter().zip(values.to_field_elements::<D>()) {
            pw.set_target(t, v);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use plonky2::field::types::Sample;
    use plonky2::plonk::config::{GenericConfig, PoseidonGoldilocksConfig};

    use super::*;

    const D: usize = 2;
    type C = PoseidonGoldilocksConfig;
    type F = <C as GenericConfig<D>>::F;
    type FE = <F as Extendable<D>>::Extension;

    fn random_bundle(shape: BundleShape) -> PublicInputValues<F, D> {
        PublicInputValues::<F, D> {
            functionals: F::rand_vec(shape.num_functionals),
            target_segment_count: F::rand_vec(shape.num_modules),
            segment_count_gl: F::rand_vec(shape.num_modules),
            segment_count_lpp: F::rand_vec(shape.num_modules),
            general_multiset_hash: F::rand_array(),
            shared_randomness_multiset_hash: F::rand_array(),
            vkey_merkle_root: F::rand_array(),
            verifying_key: [F::rand_array(), F::rand_array()],
            log_derivative_sum: FE::rand(),
            horner_sum: FE::rand(),
            grand_product: FE::rand(),
            shared_randomness: F::rand_array(),
        }
    }

    #[test]
    fn field_elements_rebuild_the_bundle() -> Result<()> {
        let shape = BundleShape::new(3, 2);
        let bundle = random_bundle(shape);
        let flat = bundle.to_field_elements::<D>();
        assert_eq!(flat.len(), shape.num_elements::<D>());
        assert_eq!(PublicInputValues::<F, D>::from_field_elements::<D>(shape, &flat)?, bundle);
        assert!(PublicInputValues::<F, D>::from_field_elements::<D>(shape, &flat[1..]).is_err());
        Ok(())
    }

    #[test]
    fn conglomerate_with_identity_keeps_channels() {
        let shape = BundleShape::new(2, 3);
        let mut a = random_bundle(shape);
        a.shared_randomness = [F::ZERO; NUM_HASH_OUT_ELTS];
        let mut id = PublicInputValues::<F, D>::identity(shape);
        id.target_segment_count = a.target_segment_count.clone();
        let vk = [HashOut::<F>::rand(), HashOut::<F>::rand()];

        let folded = PublicInputBundle::conglomerate(&a, &id, &vk);
        assert_eq!(folded.functionals, a.functionals);
        assert_eq!(folded.segment_count_gl, a.segment_count_gl);
        assert_eq!(folded.general_multiset_hash, a.general_multiset_hash);
        assert_eq!(folded.grand_product, a.grand_product);
        assert_eq!(folded.horner_sum, a.horner_sum);
        assert_eq!(folded.verifying_key(), vk);
        assert_eq!(folded.shared_randomness, [F::ZERO; NUM_HASH_OUT_ELTS]);
    }

    #[test]
    fn shared_randomness_is_taken_from_the_set_side() {
        let shape = BundleShape::new(0, 1);
        let a = PublicInputValues::<F, D>::identity(shape);
        let mut b = a.clone();
        b.shared_randomness = F::rand_array();
        let vk = [HashOut::from([F::ZERO; NUM_HASH_OUT_ELTS]); 2];
        assert_eq!(
            PublicInputBundle::conglomerate(&a, &b, &vk).shared_randomness,
            b.shared_randomness
        );
        assert_eq!(
            PublicInputBundle::conglomerate(&b, &a, &vk).shared_randomness,
            b.shared_randomness
        );
    }

    #[test]
    fn segment_total_saturates() {
        let mut bundle = PublicInputValues::<F, D>::identity(BundleShape::new(0, 3));
        bundle.segment_count_gl = vec![F::ONE, F::TWO, F::ZERO];
        assert_eq!(bundle.segment_total(SegmentKind::Gl), 3);
        assert_eq!(bundle.segment_total(SegmentKind::Conglomeration), 0);

        bundle.segment_count_lpp = vec![F::NEG_ONE, F::NEG_ONE, F::ONE];
        assert_eq!(bundle.segment_total(SegmentKind::Lpp), u64::MAX);
    }

    #[test]
    fn targets_match_value_layout() -> Result<()> {
        use plonky2::plonk::circuit_data::CircuitConfig;

        let shape = BundleShape::new(2, 2);
        let bundle = random_bundle(shape);
        let mut builder = CircuitBuilder::<F, D>::new(CircuitConfig::standard_recursion_config());
        let targets = PublicInputTargets::add_virtual(&mut builder, shape);
        assert_eq!(
            PublicInputTargets::<D>::from_targets(shape, &targets.to_targets())?,
            targets
        );
        targets.register_public_inputs(&mut builder);
        let data = builder.build::<C>();

        let mut pw = PartialWitness::new();
        targets.set_witness(&mut pw, &bundle)?;
        let proof = data.prove(pw)?;
        assert_eq!(proof.public_inputs, bundle.to_field_elements::<D>());
        data.verify(proof)
    }
}
