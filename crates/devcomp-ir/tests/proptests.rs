//! Property-based tests for shapes, literals and graphs.

use devcomp_ir::{
    eliminate_dead_code, BinaryOp, ComputationGraph, ElementType, Layout, Literal, Shape, UnaryOp,
};
use proptest::prelude::*;

// ===== Strategies =====

fn arb_element_type() -> impl Strategy<Value = ElementType> {
    prop::sample::select(ElementType::ALL.to_vec())
}

fn arb_dims() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..5, 0..4)
}

/// A permutation of `0..rank`.
fn arb_layout(rank: usize) -> impl Strategy<Value = Layout> {
    Just((0..rank).collect::<Vec<_>>())
        .prop_shuffle()
        .prop_map(Layout::new)
}

fn arb_literal() -> impl Strategy<Value = Literal> {
    (arb_element_type(), arb_dims()).prop_flat_map(|(ty, dims)| {
        let count: usize = dims.iter().product();
        prop::collection::vec(-100.0f64..100.0, count)
            .prop_map(move |values| Literal::from_values(ty, dims.clone(), values).unwrap())
    })
}

// ===== Properties =====

proptest! {
    #[test]
    fn coercion_is_idempotent(ty in arb_element_type(), value in -1e6f64..1e6) {
        let once = ty.coerce(value);
        prop_assert_eq!(ty.coerce(once), once);
    }

    #[test]
    fn literals_validate_and_match_their_shape(literal in arb_literal()) {
        prop_assert!(literal.validate().is_ok());
        let shape = literal.shape();
        prop_assert_eq!(shape.element_count(), literal.values().unwrap().len());
        prop_assert_eq!(
            literal.to_le_bytes().len(),
            shape.byte_size()
        );
    }

    #[test]
    fn relayout_keeps_values(
        (dims, layout) in arb_dims().prop_flat_map(|dims| {
            let rank = dims.len();
            (Just(dims), arb_layout(rank))
        }),
        ty in arb_element_type(),
    ) {
        let count: usize = dims.iter().product();
        let values: Vec<f64> = (0..count).map(|v| v as f64).collect();
        let literal = Literal::from_values(ty, dims.clone(), values).unwrap();
        let target = Shape::array(ty, dims).with_layout(layout);
        let laid_out = literal.relayout(&target).unwrap();
        prop_assert_eq!(laid_out.values(), literal.values());
        prop_assert_eq!(laid_out.shape(), target.clone());
        prop_assert!(target.compatible(&literal.shape()));
    }

    #[test]
    fn built_graphs_validate(steps in prop::collection::vec(0u8..3, 1..20)) {
        let mut graph = ComputationGraph::new("chain");
        let mut current = graph
            .parameter(0, Shape::array(ElementType::F32, vec![4]))
            .unwrap();
        for step in steps {
            current = match step {
                0 => graph.unary(UnaryOp::Neg, current).unwrap(),
                1 => graph.binary(BinaryOp::Add, current, current).unwrap(),
                _ => {
                    let c = graph.constant(Literal::f32(2.0)).unwrap();
                    graph.binary(BinaryOp::Multiply, current, c).unwrap()
                }
            };
        }
        prop_assert!(graph.validate().is_ok());

        let json = serde_json::to_string(&graph).unwrap();
        let back: ComputationGraph = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(&back, &graph);

        // A pure chain that ends at the root has nothing to remove.
        let (optimized, removed) = eliminate_dead_code(&graph).unwrap();
        prop_assert_eq!(removed, 0);
        prop_assert_eq!(optimized.node_count(), graph.node_count());
    }
}
