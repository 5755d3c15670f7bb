//! Parallel move resolution for phi operands at block exits.
//!
//! The moves destined for a successor's phis form a dependency graph: a
//! move may not execute while its destination is still needed as another
//! move's source. Independent moves are emitted in dependency order; cycles
//! are broken by spilling one participant into a fresh temporary.

use opal_core::Kind;

use crate::lir::operand::{Operand, OperandPool};
use crate::lir::LirOp;

/// Collects pending phi moves for one edge and emits them in a safe order.
pub struct PhiResolver<'a> {
    pool: &'a mut OperandPool,
    moves: Vec<(Operand, Operand)>,
}

impl<'a> PhiResolver<'a> {
    /// Start a resolution for one control-flow edge.
    pub fn new(pool: &'a mut OperandPool) -> PhiResolver<'a> {
        PhiResolver {
            pool,
            moves: Vec::new(),
        }
    }

    /// Record a pending move `src -> dst`.
    pub fn add(&mut self, src: Operand, dst: Operand) {
        if src != dst {
            self.moves.push((src, dst));
        }
    }

    /// Emit the moves into `out` in an order that never clobbers a pending
    /// source. Cycles spill through a fresh temporary.
    pub fn resolve(mut self, out: &mut Vec<LirOp>) {
        while !self.moves.is_empty() {
            // A move is safe when no other pending move still reads its
            // destination.
            let safe = self.moves.iter().position(|(_, dst)| {
                !self
                    .moves
                    .iter()
                    .any(|(other_src, other_dst)| other_dst != dst && other_src == dst)
            });
            match safe {
                Some(index) => {
                    let (src, dst) = self.moves.swap_remove(index);
                    out.push(LirOp::Move { src, dst });
                }
                None => {
                    // Every destination is still read: a cycle. Save one
                    // destination's current value and redirect its readers.
                    let (_, dst) = self.moves[0].clone();
                    let kind = if dst.kind() == Kind::Illegal {
                        Kind::Word
                    } else {
                        dst.kind()
                    };
                    let temp = self.pool.new_variable(kind);
                    out.push(LirOp::Move {
                        src: dst.clone(),
                        dst: temp.clone(),
                    });
                    for (src, _) in self.moves.iter_mut() {
                        if *src == dst {
                            *src = temp.clone();
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::operand::VarId;

    fn var(pool: &mut OperandPool) -> Operand {
        pool.new_variable(Kind::Int)
    }

    fn moves_of(ops: &[LirOp]) -> Vec<(Operand, Operand)> {
        ops.iter()
            .map(|op| match op {
                LirOp::Move { src, dst } => (src.clone(), dst.clone()),
                other => panic!("unexpected op {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_independent_moves_pass_through() {
        let mut pool = OperandPool::new();
        let a = var(&mut pool);
        let b = var(&mut pool);
        let c = var(&mut pool);
        let d = var(&mut pool);
        let mut resolver = PhiResolver::new(&mut pool);
        resolver.add(a.clone(), b.clone());
        resolver.add(c.clone(), d.clone());
        let mut out = Vec::new();
        resolver.resolve(&mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_chain_ordered_leaf_first() {
        // a -> b, b -> c: must emit b->c before a->b.
        let mut pool = OperandPool::new();
        let a = var(&mut pool);
        let b = var(&mut pool);
        let c = var(&mut pool);
        let mut resolver = PhiResolver::new(&mut pool);
        resolver.add(a.clone(), b.clone());
        resolver.add(b.clone(), c.clone());
        let mut out = Vec::new();
        resolver.resolve(&mut out);
        let moves = moves_of(&out);
        assert_eq!(moves[0], (b.clone(), c));
        assert_eq!(moves[1], (a, b));
    }

    #[test]
    fn test_swap_cycle_spills_through_temp() {
        // a -> b, b -> a.
        let mut pool = OperandPool::new();
        let a = var(&mut pool);
        let b = var(&mut pool);
        let mut resolver = PhiResolver::new(&mut pool);
        resolver.add(a.clone(), b.clone());
        resolver.add(b.clone(), a.clone());
        let mut out = Vec::new();
        resolver.resolve(&mut out);
        // Save, then the two redirected moves.
        assert_eq!(out.len(), 3);
        let moves = moves_of(&out);
        // First move saves one destination into a fresh temp.
        let temp = moves[0].1.clone();
        assert!(matches!(temp, Operand::Var { id, .. } if id >= VarId(2)));
        // Simulate: after executing the sequence, a holds b's original
        // value and b holds a's.
        let mut env: Vec<(Operand, &'static str)> =
            vec![(a.clone(), "a0"), (b.clone(), "b0")];
        for (src, dst) in &moves {
            let value = env
                .iter()
                .find(|(o, _)| o == src)
                .map(|(_, v)| *v)
                .expect("source has a value");
            env.retain(|(o, _)| o != dst);
            env.push((dst.clone(), value));
        }
        let lookup = |o: &Operand| env.iter().find(|(x, _)| x == o).map(|(_, v)| *v);
        assert_eq!(lookup(&a), Some("b0"));
        assert_eq!(lookup(&b), Some("a0"));
    }

    #[test]
    fn test_self_move_elided() {
        let mut pool = OperandPool::new();
        let a = var(&mut pool);
        let mut resolver = PhiResolver::new(&mut pool);
        resolver.add(a.clone(), a.clone());
        let mut out = Vec::new();
        resolver.resolve(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_constant_sources_resolve() {
        use crate::value::ConstValue;
        let mut pool = OperandPool::new();
        let a = var(&mut pool);
        let b = var(&mut pool);
        let mut resolver = PhiResolver::new(&mut pool);
        resolver.add(Operand::Const(ConstValue::Int(7)), a.clone());
        resolver.add(a.clone(), b.clone());
        let mut out = Vec::new();
        resolver.resolve(&mut out);
        let moves = moves_of(&out);
        // a is read by the second move, so a -> b must come first.
        assert_eq!(moves[0], (a.clone(), b));
        assert_eq!(moves[1], (Operand::Const(ConstValue::Int(7)), a));
    }
}
