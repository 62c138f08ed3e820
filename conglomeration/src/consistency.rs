//! Native checks relating the public inputs of two folded proofs to those of their parent.
//!
//! Every check runs even after an earlier one failed, so a single call reports all the
//! inconsistencies of a fold.

use log::debug;
use plonky2::field::extension::Extendable;
use plonky2::field::types::Field;
use plonky2::hash::hash_types::RichField;

use crate::error::{Violation, Violations};
use crate::multiset::{combine_multiset_hash, is_empty_multiset_hash};
use crate::public_inputs::{PublicInputBundle, PublicInputValues};
use crate::segment::SegmentKind;
use crate::vk_tree::{verify_membership, VerificationKeyMerkleTree, VkPath};

/// Number of proofs folded into one parent.
pub const AGGREGATION_ARITY: usize = 2;

/// Derives which leaf of the verifying key tree a bundle was produced under.
///
/// A bundle counting exactly one segment is a leaf proof of that segment's kind and module;
/// a bundle counting more is a conglomeration node. `None` if it counts no segment at all.
///
/// The counts are summed as field elements, exactly as the conglomeration circuit sums them.
pub fn locate_leaf<F: RichField, E>(
    bundle: &PublicInputBundle<F, E>,
) -> Option<(SegmentKind, usize)> {
    let mut sum_gl = F::ZERO;
    let mut sum_lpp = F::ZERO;
    let mut module_index = 0;
    for (module, (gl, lpp)) in bundle
        .segment_count_gl
        .iter()
        .zip(&bundle.segment_count_lpp)
        .enumerate()
    {
        sum_gl += *gl;
        sum_lpp += *lpp;
        if !(*gl + *lpp).is_zero() {
            module_index = module;
        }
    }
    if (sum_gl + sum_lpp).is_zero() {
        None
    } else if sum_gl == F::ONE && sum_lpp == F::ZERO {
        Some((SegmentKind::Gl, module_index))
    } else if sum_gl == F::ZERO && sum_lpp == F::ONE {
        Some((SegmentKind::Lpp, module_index))
    } else {
        Some((SegmentKind::Conglomeration, 0))
    }
}

/// Checks `parent = fold(children[0], children[1])`, using `paths[i]` to authenticate the
/// verifying key of `children[i]`.
pub fn check_fold<F: RichField + Extendable<D>, const D: usize>(
    tree: &VerificationKeyMerkleTree<F>,
    children: [&PublicInputValues<F, D>; AGGREGATION_ARITY],
    parent: &PublicInputValues<F, D>,
    paths: [&VkPath<F>; AGGREGATION_ARITY],
) -> Result<(), Violations> {
    let mut violations = Violations::default();
    let [a, b] = children;

    let shape = parent.shape();
    for (instance, child) in children.iter().enumerate() {
        if child.shape() != shape {
            violations.push(Violation::ShapeMismatch { instance });
        }
    }
    if !violations.is_empty() {
        return violations.into_result();
    }

    for (index, p) in parent.functionals.iter().enumerate() {
        if a.functionals[index] + b.functionals[index] != *p {
            violations.push(Violation::Functional { index });
        }
    }

    for module in 0..shape.num_modules {
        for (instance, child) in children.iter().enumerate() {
            if child.target_segment_count[module] != parent.target_segment_count[module] {
                violations.push(Violation::TargetSegmentCount { module, instance });
            }
        }
        if a.segment_count_gl[module] + b.segment_count_gl[module]
            != parent.segment_count_gl[module]
        {
            violations.push(Violation::SegmentCountGl { module });
        }
        if a.segment_count_lpp[module] + b.segment_count_lpp[module]
            != parent.segment_count_lpp[module]
        {
            violations.push(Violation::SegmentCountLpp { module });
        }
    }

    let general = combine_multiset_hash(&a.general_multiset_hash, &b.general_multiset_hash);
    let shared = combine_multiset_hash(
        &a.shared_randomness_multiset_hash,
        &b.shared_randomness_multiset_hash,
    );
    for index in 0..general.len() {
        if general[index] != parent.general_multiset_hash[index] {
            violations.push(Violation::GeneralMultisetHash { index });
        }
        if shared[index] != parent.shared_randomness_multiset_hash[index] {
            violations.push(Violation::SharedRandomnessMultisetHash { index });
        }
    }

    if a.log_derivative_sum + b.log_derivative_sum != parent.log_derivative_sum {
        violations.push(Violation::LogDerivativeSum);
    }
    if a.horner_sum + b.horner_sum != parent.horner_sum {
        violations.push(Violation::HornerSum);
    }
    if a.grand_product * b.grand_product != parent.grand_product {
        violations.push(Violation::GrandProduct);
    }

    // Zero stands for "unset": a set element must match the parent, and the parent may only be
    // set where one of the children is.
    for (instance, child) in children.iter().enumerate() {
        let mismatch = child
            .shared_randomness
            .iter()
            .zip(&parent.shared_randomness)
            .any(|(c, p)| !c.is_zero() && c != p);
        if mismatch {
            violations.push(Violation::SharedRandomness { instance });
        }
    }
    let invented = (0..parent.shared_randomness.len()).any(|i| {
        a.shared_randomness[i].is_zero()
            && b.shared_randomness[i].is_zero()
            && !parent.shared_randomness[i].is_zero()
    });
    if invented {
        violations.push(Violation::SharedRandomness {
            instance: AGGREGATION_ARITY,
        });
    }

    for (instance, child) in children.iter().enumerate() {
        if child.vkey_merkle_root != parent.vkey_merkle_root {
            violations.push(Violation::VkMerkleRoot { instance });
        }
    }
    if parent.vkey_merkle_root() != tree.root() {
        violations.push(Violation::ForeignVkMerkleRoot);
    }

    for (instance, (child, path)) in children.iter().zip(paths).enumerate() {
        let Some((kind, module_index)) = locate_leaf(child) else {
            violations.push(Violation::EmptySegmentCounts { instance });
            continue;
        };
        let Some(position) = tree.leaf_position(kind, module_index) else {
            violations.push(Violation::EmptySegmentCounts { instance });
            continue;
        };
        if !verify_membership(
            position,
            &child.verifying_key(),
            child.vkey_merkle_root(),
            path,
        ) {
            debug!(
                "verifying key of instance {} rejected at position {}",
                instance,
                position
            );
            violations.push(Violation::VkMembership {
                instance,
                position,
                kind,
                module_index,
            });
        }
    }

    violations.into_result()
}

/// Totals the root proof must account for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootExpectations {
    pub num_gl: usize,
    pub num_lpp: usize,
}

/// Checks the terminal values of the final proof: every accumulator has telescoped to its
/// neutral value and every expected segment is counted.
pub fn check_root<F: RichField + Extendable<D>, const D: usize>(
    root: &PublicInputValues<F, D>,
    expected: RootExpectations,
) -> Result<(), Violations> {
    let mut violations = Violations::default();
    if root.grand_product != F::Extension::ONE {
        violations.push(Violation::RootTerminal {
            field: "grand product",
        });
    }
    if root.log_derivative_sum != F::Extension::ZERO {
        violations.push(Violation::RootTerminal {
            field: "log-derivative sum",
        });
    }
    if root.horner_sum != F::Extension::ZERO {
        violations.push(Violation::RootTerminal {
            field: "horner sum",
        });
    }
    if !is_empty_multiset_hash(&root.general_multiset_hash) {
        violations.push(Violation::RootTerminal {
            field: "general multiset hash",
        });
    }
    if !is_empty_multiset_hash(&root.shared_randomness_multiset_hash) {
        violations.push(Violation::RootTerminal {
            field: "shared-randomness multiset hash",
        });
    }
    for (kind, expected) in [
        (SegmentKind::Gl, expected.num_gl),
        (SegmentKind::Lpp, expected.num_lpp),
    ] {
        let found = root.segment_total(kind);
        if found != expected as u64 {
            violations.push(Violation::RootSegmentTotal {
                kind,
                found,
                expected: expected as u64,
            });
        }
    }
    violations.into_result()
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use plonky2::field::types::Sample;
    use plonky2::hash::hash_types::HashOut;
    use plonky2::plonk::config::{GenericConfig, PoseidonGoldilocksConfig};

    use super::*;
    use crate::public_inputs::BundleShape;
    use crate::vk_tree::VerifyingKey;

    const D: usize = 2;
    type C = PoseidonGoldilocksConfig;
    type F = <C as GenericConfig<D>>::F;
    type FE = <F as Extendable<D>>::Extension;

    const NUM_MODULES: usize = 2;

    struct Fixture {
        tree: VerificationKeyMerkleTree<F>,
        gl_vks: Vec<VerifyingKey<F>>,
        lpp_vks: Vec<VerifyingKey<F>>,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let random_vks = || {
                (0..NUM_MODULES)
                    .map(|_| [HashOut::rand(), HashOut::rand()])
                    .collect::<Vec<_>>()
            };
            let gl_vks = random_vks();
            let lpp_vks = random_vks();
            let tree = VerificationKeyMerkleTree::build(
                &gl_vks,
                &lpp_vks,
                [HashOut::rand(), HashOut::rand()],
            )?;
            Ok(Self {
                tree,
                gl_vks,
                lpp_vks,
            })
        }

        fn leaf(&self, kind: SegmentKind, module: usize) -> PublicInputValues<F, D> {
            let mut bundle = PublicInputValues::<F, D>::identity(BundleShape::new(2, NUM_MODULES));
            bundle.target_segment_count = vec![F::TWO; NUM_MODULES];
            bundle.functionals = F::rand_vec(2);
            bundle.general_multiset_hash = F::rand_array();
            bundle.grand_product = FE::rand();
            bundle.log_derivative_sum = FE::rand();
            bundle.vkey_merkle_root = self.tree.root().elements;
            match kind {
                SegmentKind::Gl => {
                    bundle.segment_count_gl[module] = F::ONE;
                    bundle.set_verifying_key(&self.gl_vks[module]);
                }
                SegmentKind::Lpp => {
                    bundle.segment_count_lpp[module] = F::ONE;
                    bundle.shared_randomness = F::rand_array();
                    bundle.set_verifying_key(&self.lpp_vks[module]);
                }
                SegmentKind::Conglomeration => unreachable!(),
            }
            bundle
        }

        fn path(&self, bundle: &PublicInputValues<F, D>) -> VkPath<F> {
            let (kind, module) = locate_leaf(bundle).expect("bundle counts segments");
            let position = self.tree.leaf_position(kind, module).expect("known module");
            self.tree.prove(position).expect("position in range")
        }

        fn fold(
            &self,
            a: &PublicInputValues<F, D>,
            b: &PublicInputValues<F, D>,
        ) -> PublicInputValues<F, D> {
            PublicInputBundle::conglomerate(a, b, self.tree.conglomeration_vk())
        }

        fn check(
            &self,
            a: &PublicInputValues<F, D>,
            b: &PublicInputValues<F, D>,
            parent: &PublicInputValues<F, D>,
        ) -> Result<(), Violations> {
            check_fold::<F, D>(
                &self.tree,
                [a, b],
                parent,
                [&self.path(a), &self.path(b)],
            )
        }
    }

    #[test]
    fn honest_folds_pass() -> Result<()> {
        let fx = Fixture::new()?;
        let a = fx.leaf(SegmentKind::Gl, 0);
        let b = fx.leaf(SegmentKind::Lpp, 1);
        let ab = fx.fold(&a, &b);
        assert_eq!(fx.check(&a, &b, &ab), Ok(()));

        let c = fx.leaf(SegmentKind::Gl, 1);
        let abc = fx.fold(&ab, &c);
        assert_eq!(locate_leaf(&ab), Some((SegmentKind::Conglomeration, 0)));
        assert_eq!(fx.check(&ab, &c, &abc), Ok(()));
        Ok(())
    }

    #[test]
    fn locates_leaves() -> Result<()> {
        let fx = Fixture::new()?;
        assert_eq!(
            locate_leaf(&fx.leaf(SegmentKind::Lpp, 1)),
            Some((SegmentKind::Lpp, 1))
        );
        assert_eq!(
            locate_leaf(&fx.leaf(SegmentKind::Gl, 0)),
            Some((SegmentKind::Gl, 0))
        );
        let empty = PublicInputValues::<F, D>::identity(BundleShape::new(0, NUM_MODULES));
        assert_eq!(locate_leaf(&empty), None);
        Ok(())
    }

    #[test]
    fn locates_leaves_modulo_the_field() {
        let shape = BundleShape::new(0, NUM_MODULES);
        let counts = |gl: [F; NUM_MODULES], lpp: [F; NUM_MODULES]| {
            let mut bundle = PublicInputValues::<F, D>::identity(shape);
            bundle.segment_count_gl = gl.to_vec();
            bundle.segment_count_lpp = lpp.to_vec();
            locate_leaf(&bundle)
        };
        let zero = [F::ZERO; NUM_MODULES];
        assert_eq!(
            counts([F::NEG_ONE, F::TWO], zero),
            Some((SegmentKind::Gl, 1))
        );
        assert_eq!(
            counts(zero, [F::TWO, F::NEG_ONE]),
            Some((SegmentKind::Lpp, 1))
        );
        assert_eq!(counts([F::NEG_ONE, F::ONE], zero), None);
        assert_eq!(
            counts([F::NEG_ONE, F::NEG_ONE], zero),
            Some((SegmentKind::Conglomeration, 0))
        );
    }

    #[test]
    fn wrapping_counts_are_reported_not_panicked_on() -> Result<()> {
        let fx = Fixture::new()?;
        let mut a = fx.leaf(SegmentKind::Gl, 0);
        a.segment_count_gl = vec![F::NEG_ONE; NUM_MODULES];
        let b = fx.leaf(SegmentKind::Gl, 1);
        let parent = fx.fold(&a, &b);

        let violations = fx.check(&a, &b, &parent).unwrap_err();
        assert_eq!(
            violations.0,
            vec![Violation::VkMembership {
                instance: 0,
                position: 2 * NUM_MODULES,
                kind: SegmentKind::Conglomeration,
                module_index: 0,
            }]
        );
        Ok(())
    }

    #[test]
    fn target_count_mismatch_is_reported() -> Result<()> {
        let fx = Fixture::new()?;
        let a = fx.leaf(SegmentKind::Gl, 0);
        let mut b = fx.leaf(SegmentKind::Gl, 1);
        b.target_segment_count[1] = F::from_canonical_u64(3);
        let parent = fx.fold(&a, &b);
        let violations = fx.check(&a, &b, &parent).unwrap_err();
        assert_eq!(
            violations.0,
            vec![Violation::TargetSegmentCount {
                module: 1,
                instance: 1
            }]
        );
        Ok(())
    }

    #[test]
    fn all_violations_are_collected() -> Result<()> {
        let fx = Fixture::new()?;
        let a = fx.leaf(SegmentKind::Gl, 0);
        let b = fx.leaf(SegmentKind::Gl, 1);
        let mut parent = fx.fold(&a, &b);
        parent.functionals[1] += F::ONE;
        parent.grand_product = parent.grand_product.double();
        parent.horner_sum = FE::ONE;
        parent.general_multiset_hash[7] = F::ZERO;
        parent.shared_randomness = F::rand_array();

        let violations = fx.check(&a, &b, &parent).unwrap_err();
        assert!(violations.0.contains(&Violation::Functional { index: 1 }));
        assert!(violations.0.contains(&Violation::GrandProduct));
        assert!(violations.0.contains(&Violation::HornerSum));
        assert!(violations.0.contains(&Violation::GeneralMultisetHash { index: 7 }));
        assert!(violations.0.contains(&Violation::SharedRandomness { instance: 2 }));
        assert!(!violations.only_membership());
        Ok(())
    }

    #[test]
    fn conflicting_shared_randomness_is_rejected() -> Result<()> {
        let fx = Fixture::new()?;
        let a = fx.leaf(SegmentKind::Lpp, 0);
        let b = fx.leaf(SegmentKind::Lpp, 1);
        let parent = fx.fold(&a, &b);
        let violations = fx.check(&a, &b, &parent).unwrap_err();
        assert_eq!(violations.0, vec![Violation::SharedRandomness { instance: 1 }]);
        Ok(())
    }

    #[test]
    fn tampered_verifying_key_fails_membership() -> Result<()> {
        let fx = Fixture::new()?;
        let a = fx.leaf(SegmentKind::Gl, 0);
        let mut b = fx.leaf(SegmentKind::Lpp, 0);
        let path_b = fx.path(&b);
        b.verifying_key[0][3] += F::ONE;
        let parent = fx.fold(&a, &b);

        let violations = check_fold::<F, D>(&fx.tree, [&a, &b], &parent, [&fx.path(&a), &path_b])
            .unwrap_err();
        assert!(violations.only_membership());
        assert_eq!(
            violations.0,
            vec![Violation::VkMembership {
                instance: 1,
                position: NUM_MODULES,
                kind: SegmentKind::Lpp,
                module_index: 0,
            }]
        );
        Ok(())
    }

    #[test]
    fn root_terminal_values() -> Result<()> {
        let shape = BundleShape::new(1, NUM_MODULES);
        let mut root = PublicInputValues::<F, D>::identity(shape);
        root.segment_count_gl = vec![F::TWO, F::ONE];
        root.segment_count_lpp = vec![F::ONE, F::ONE];
        let expected = RootExpectations {
            num_gl: 3,
            num_lpp: 2,
        };
        assert_eq!(check_root::<F, D>(&root, expected), Ok(()));

        root.grand_product = FE::TWO;
        root.segment_count_lpp[0] = F::ZERO;
        let violations = check_root::<F, D>(&root, expected).unwrap_err();
        assert_eq!(
            violations.0,
            vec![
                Violation::RootTerminal {
                    field: "grand product"
                },
                Violation::RootSegmentTotal {
                    kind: SegmentKind::Lpp,
                    found: 1,
                    expected: 2
                },
            ]
        );
        Ok(())
    }
}
