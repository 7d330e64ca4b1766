// tests/naming_properties.rs

use proptest::prelude::*;

use kernelbuild::graph::{NodeRef, compute_kernel_identity, is_valid_kernel_name};
use kernelbuild::types::TaskNamespace;
use kernelbuild_test_utils::builders::OpDescBuilder;

const OP_TYPES: &[&str] = &["Add", "Mul", "Relu", "Cast", "Exp", "LayerNorm"];

/// One node of a generated fusion set: its op type and, for every node but
/// the first, an optional producer among the earlier nodes.
#[derive(Debug, Clone)]
struct NodePlan {
    op: usize,
    producer: Option<usize>,
    rows: i64,
}

// Acyclic by construction: node N may only read from nodes 0..N-1.
fn fusion_strategy(max_nodes: usize) -> impl Strategy<Value = Vec<NodePlan>> {
    proptest::collection::vec(
        (0..OP_TYPES.len(), proptest::option::of(any::<usize>()), 1..64i64),
        1..=max_nodes,
    )
    .prop_map(|raw| {
        raw.into_iter()
            .enumerate()
            .map(|(i, (op, producer, rows))| NodePlan {
                op,
                producer: if i == 0 { None } else { producer.map(|p| p % i) },
                rows,
            })
            .collect()
    })
}

/// Materialise `plans` with node ids starting at `id_base`.
fn nodes(plans: &[NodePlan], id_base: u64) -> Vec<NodeRef> {
    plans
        .iter()
        .enumerate()
        .map(|(i, plan)| {
            let builder =
                OpDescBuilder::new(id_base + i as u64, OP_TYPES[plan.op]).shape(&[plan.rows, 16]);
            let builder = match plan.producer {
                Some(p) => builder.input_from(id_base + p as u64, 0),
                None => builder.external_input(i),
            };
            builder.output().node()
        })
        .collect()
}

proptest! {
    #[test]
    fn names_ignore_node_order_and_ids(
        plans in fusion_strategy(6),
        id_base in 0u64..10_000,
        order in Just((0..6usize).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let original = nodes(&plans, 0);
        let renumbered = nodes(&plans, id_base);
        let permuted: Vec<NodeRef> = order
            .iter()
            .filter(|&&i| i < renumbered.len())
            .map(|&i| renumbered[i].clone())
            .collect();

        let a = compute_kernel_identity(TaskNamespace::FusionOp, &original).unwrap();
        let b = compute_kernel_identity(TaskNamespace::FusionOp, &permuted).unwrap();
        prop_assert_eq!(&a.kernel_name, &b.kernel_name);
        prop_assert!(is_valid_kernel_name(&a.kernel_name));
        prop_assert_eq!(a.topo_order.len(), plans.len());
    }

    #[test]
    fn changed_content_changes_the_name(
        plans in fusion_strategy(5),
        victim in any::<usize>(),
        extra_rows in 1..64i64,
    ) {
        let mut changed = plans.clone();
        let victim = victim % changed.len();
        changed[victim].rows += extra_rows;

        let a = compute_kernel_identity(TaskNamespace::FusionOp, &nodes(&plans, 0)).unwrap();
        let b = compute_kernel_identity(TaskNamespace::FusionOp, &nodes(&changed, 0)).unwrap();
        prop_assert_ne!(a.kernel_name, b.kernel_name);
    }

    #[test]
    fn namespaces_never_share_names(rows in 1..512i64, op in 0..OP_TYPES.len()) {
        let single = nodes(&[NodePlan { op, producer: None, rows }], 0);
        let a = compute_kernel_identity(TaskNamespace::SingleOp, &single).unwrap();
        let b = compute_kernel_identity(TaskNamespace::FusionOp, &single).unwrap();
        let c = compute_kernel_identity(TaskNamespace::TaskFusion, &single).unwrap();
        prop_assert_ne!(&a.kernel_name, &b.kernel_name);
        prop_assert_ne!(&b.kernel_name, &c.kernel_name);
        prop_assert_ne!(&a.kernel_name, &c.kernel_name);
    }
}
