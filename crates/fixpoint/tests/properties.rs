//! Property-based tests over randomly generated edge relations.

use fixpoint::{
    facts, inject_into, solve, union, BodyPredicate, BodyTerm, Constraint, Datalog, Denotation,
    HeadAtom, HeadTerm, Options, PredSym, Program, RelSym,
};
use proptest::prelude::*;
use std::collections::HashSet;

fn edge_rel() -> RelSym {
    RelSym::new(PredSym::new("Edge", 0), 2, Denotation::Relational)
}

fn path_rel() -> RelSym {
    RelSym::new(PredSym::new("Path", 1), 2, Denotation::Relational)
}

fn tc_program(edges: Vec<(i64, i64)>) -> Datalog {
    let edge = edge_rel();
    let path = path_rel();
    let rules = vec![
        Constraint::rule(
            HeadAtom::new(path.clone(), vec![HeadTerm::var("x"), HeadTerm::var("y")]),
            vec![BodyPredicate::atom(
                edge.clone(),
                vec![BodyTerm::var("x"), BodyTerm::var("y")],
            )],
        ),
        Constraint::rule(
            HeadAtom::new(path.clone(), vec![HeadTerm::var("x"), HeadTerm::var("z")]),
            vec![
                BodyPredicate::atom(path.clone(), vec![BodyTerm::var("x"), BodyTerm::var("y")]),
                BodyPredicate::atom(edge.clone(), vec![BodyTerm::var("y"), BodyTerm::var("z")]),
            ],
        ),
    ];
    union(
        inject_into(edge_rel().pred, edges),
        Datalog::Program(Program::new(vec![], rules)),
    )
}

fn edges_strategy() -> impl Strategy<Value = Vec<(i64, i64)>> {
    prop::collection::vec((0i64..8, 0i64..8), 0..20)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_union_is_commutative(e1 in edges_strategy(), e2 in edges_strategy()) {
        let opts = Options::default();
        let d1 = tc_program(e1);
        let d2 = inject_into(edge_rel().pred, e2);
        let m1 = solve(&union(d1.clone(), d2.clone()), &opts).unwrap();
        let m2 = solve(&union(d2, d1), &opts).unwrap();
        prop_assert_eq!(m1, m2);
    }

    #[test]
    fn prop_solving_a_solved_model_changes_nothing(edges in edges_strategy()) {
        let opts = Options::default();
        let d = tc_program(edges);
        let once = solve(&d, &opts).unwrap();
        let again = solve(&union(d, Datalog::Model(once.clone())), &opts).unwrap();
        prop_assert_eq!(once, again);
    }

    #[test]
    fn prop_every_path_is_edge_or_composition(edges in edges_strategy()) {
        let opts = Options::default();
        let model = solve(&tc_program(edges.clone()), &opts).unwrap();
        let paths: HashSet<(i64, i64)> =
            facts::<(i64, i64)>(path_rel().pred, &Datalog::Model(model)).into_iter().collect();
        let edge_set: HashSet<(i64, i64)> = edges.into_iter().collect();
        for &(x, z) in &paths {
            let witnessed = edge_set.contains(&(x, z))
                || paths.iter().any(|&(a, y)| {
                    a == x && paths.contains(&(x, y)) && edge_set.contains(&(y, z))
                });
            prop_assert!(witnessed, "({}, {}) has no witness", x, z);
        }
        // And conversely every edge is a path.
        for &(x, y) in &edge_set {
            prop_assert!(paths.contains(&(x, y)));
        }
    }

    #[test]
    fn prop_inject_facts_round_trip(rows in prop::collection::vec((0i64..100, 0i64..100), 0..30)) {
        let d = inject_into(edge_rel().pred, rows.clone());
        let mut expected = rows;
        expected.sort_unstable();
        expected.dedup();
        prop_assert_eq!(facts::<(i64, i64)>(edge_rel().pred, &d), expected);
    }
}
