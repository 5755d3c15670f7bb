//! Linear-scan interval construction and assignment.

use rustc_hash::FxHashMap;

use opal_core::{Bailout, CompileResult, Kind};

use crate::lir::operand::{Operand, VarId};
use crate::lir::{Lir, LirOp};
use crate::regalloc::Assignment;
use crate::target::registers::{Gpr, Reg, Xmm};
use crate::target::Target;
use crate::xir::XirOp;

/// Registers the allocator hands out: the caller-saved subset, so values
/// never need saving around calls (anything live across a call is spilled).
const GPR_POOL: [Gpr; 8] = [
    Gpr::Rax,
    Gpr::Rcx,
    Gpr::Rdx,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
];

/// Result of an allocation run.
#[derive(Debug, Clone)]
pub struct AllocResult {
    /// Number of frame spill slots used, including the reserved scratch
    /// slot 0.
    pub spill_slots: u32,
    /// Spill slots assigned to object-kinded values; the emitter zaps
    /// these in the prologue and marks them in every stack map.
    pub object_spill_slots: Vec<i32>,
}

#[derive(Debug, Clone)]
struct Interval {
    var: VarId,
    kind: Kind,
    start: u32,
    end: u32,
    fixed: Option<Reg>,
    crosses_call: bool,
}

/// Assign every virtual operand in `lir` a register or frame slot,
/// rewriting the operation lists in place.
pub fn allocate(lir: &mut Lir, target: &Target) -> CompileResult<AllocResult> {
    let mut intervals = build_intervals(lir);
    if intervals.is_empty() {
        rewrite(lir, &FxHashMap::default());
        return Ok(AllocResult {
            spill_slots: 1,
            object_spill_slots: Vec::new(),
        });
    }
    intervals.sort_by_key(|iv| (iv.start, iv.var));

    let mut assignments: FxHashMap<VarId, Assignment> = FxHashMap::default();
    // Spill slot 0 is the reserved scratch slot.
    let mut next_slot: i32 = 1;
    let mut object_spill_slots: Vec<i32> = Vec::new();
    // (end, var, reg, has fixed binding)
    let mut active: Vec<(u32, VarId, Reg, bool)> = Vec::new();
    let mut free_gprs: Vec<Gpr> = GPR_POOL
        .iter()
        .copied()
        .filter(|r| target.allocatable_gprs.contains(*r))
        .collect();
    let mut free_xmms: Vec<Xmm> = Xmm::ALL
        .iter()
        .copied()
        .filter(|r| target.allocatable_xmms.contains(*r))
        .collect();

    let pool_kinds: FxHashMap<VarId, Kind> = intervals
        .iter()
        .map(|iv| (iv.var, iv.kind))
        .collect();
    let mut spill = |assignments: &mut FxHashMap<VarId, Assignment>, var: VarId| {
        let slot = next_slot;
        next_slot += 1;
        if pool_kinds.get(&var).copied() == Some(Kind::Object) {
            object_spill_slots.push(slot);
        }
        assignments.insert(var, Assignment::Stack(slot));
    };

    for iv in &intervals {
        // Expire finished intervals.
        let mut expired: Vec<(u32, VarId, Reg, bool)> = Vec::new();
        active.retain(|entry| {
            if entry.0 < iv.start {
                expired.push(*entry);
                false
            } else {
                true
            }
        });
        for (_, _, reg, _) in expired {
            match reg {
                Reg::Gpr(g) => free_gprs.push(g),
                Reg::Xmm(x) => free_xmms.push(x),
            }
        }

        if iv.crosses_call && iv.fixed.is_none() {
            spill(&mut assignments, iv.var);
            continue;
        }

        if let Some(reg) = iv.fixed {
            // Evict whoever holds the required register.
            if let Some(pos) = active.iter().position(|(_, _, r, _)| *r == reg) {
                let (_, holder, _, holder_fixed) = active.remove(pos);
                if holder_fixed {
                    return Err(Bailout::register_constraint(format!(
                        "conflicting fixed bindings on {reg}"
                    )));
                }
                spill(&mut assignments, holder);
            }
            match reg {
                Reg::Gpr(g) => free_gprs.retain(|r| *r != g),
                Reg::Xmm(x) => free_xmms.retain(|r| *r != x),
            }
            assignments.insert(iv.var, Assignment::Reg(reg));
            active.push((iv.end, iv.var, reg, true));
            continue;
        }

        let picked = if iv.kind.is_float() {
            free_xmms.pop().map(Reg::Xmm)
        } else {
            free_gprs.pop().map(Reg::Gpr)
        };
        match picked {
            Some(reg) => {
                assignments.insert(iv.var, Assignment::Reg(reg));
                active.push((iv.end, iv.var, reg, false));
            }
            None => {
                // Pressure: spill whichever of {current, furthest active
                // of the same class} ends last. Fixed holders stay put.
                let furthest = active
                    .iter()
                    .enumerate()
                    .filter(|(_, (_, _, r, fixed))| {
                        !fixed && r.is_gpr() == !iv.kind.is_float()
                    })
                    .max_by_key(|(_, (end, _, _, _))| *end)
                    .map(|(i, entry)| (i, *entry));
                match furthest {
                    Some((index, (end, holder, reg, _))) if end > iv.end => {
                        active.remove(index);
                        spill(&mut assignments, holder);
                        assignments.insert(iv.var, Assignment::Reg(reg));
                        active.push((iv.end, iv.var, reg, false));
                    }
                    _ => spill(&mut assignments, iv.var),
                }
            }
        }
    }

    rewrite(lir, &assignments);
    Ok(AllocResult {
        spill_slots: next_slot as u32,
        object_spill_slots,
    })
}

/// Build one interval per variable from first to last occurrence, extended
/// over loop back edges and marked when live across a call.
fn build_intervals(lir: &Lir) -> Vec<Interval> {
    // Linear positions: ops numbered consecutively across the block order.
    let mut block_start: FxHashMap<crate::hir::BlockId, u32> = FxHashMap::default();
    let mut pos = 0u32;
    let mut positions: Vec<(u32, &LirOp)> = Vec::new();
    for &block in &lir.order {
        block_start.insert(block, pos);
        if let Some(list) = lir.list_for(block) {
            for op in &list.ops {
                positions.push((pos, op));
                pos += 1;
            }
        }
    }

    let mut ranges: FxHashMap<VarId, (u32, u32)> = FxHashMap::default();
    let mut call_positions: Vec<u32> = Vec::new();
    let mut back_edges: Vec<(u32, u32)> = Vec::new(); // (target_start, branch_pos)

    for &(at, op) in &positions {
        op.for_each_operand(|operand, _| {
            if let Some(var) = operand.as_var() {
                let entry = ranges.entry(var).or_insert((at, at));
                entry.0 = entry.0.min(at);
                entry.1 = entry.1.max(at);
            }
        });
        // Calls clobber every caller-saved register; integer division
        // (cqo writes RDX) and compare-and-swap (RAX) clobber fixed
        // registers. Values crossing any of these live in the frame.
        let clobbers = op.is_stop()
            || xir_calls(op)
            || matches!(
                op,
                LirOp::Arith {
                    op: crate::hir::ArithOp::Div | crate::hir::ArithOp::Rem,
                    ..
                } | LirOp::CompareAndSwap { .. }
            );
        if clobbers {
            call_positions.push(at);
        }
        let target = match op {
            LirOp::Jump {
                target: crate::lir::BranchTarget::Block(b),
            }
            | LirOp::Branch {
                target: crate::lir::BranchTarget::Block(b),
                ..
            } => Some(*b),
            _ => None,
        };
        if let Some(b) = target {
            if let Some(&start) = block_start.get(&b) {
                if start <= at {
                    back_edges.push((start, at));
                }
            }
        }
    }

    // A value defined before a loop and used inside it stays live until
    // the back edge.
    for (start, branch) in back_edges {
        for (_, range) in ranges.iter_mut() {
            if range.0 < start && range.1 >= start && range.1 < branch {
                range.1 = branch;
            }
        }
    }

    let mut intervals: Vec<Interval> = ranges
        .into_iter()
        .map(|(var, (start, end))| {
            let crosses_call = call_positions
                .iter()
                .any(|&cp| start < cp && end > cp);
            Interval {
                var,
                kind: lir.pool.kind_of(var),
                start,
                end,
                fixed: lir.pool.fixed_binding(var),
                crosses_call,
            }
        })
        .collect();
    intervals.sort_by_key(|iv| iv.var);
    intervals
}

/// Whether an op's template performs a runtime call (clobbering registers
/// like any other call).
fn xir_calls(op: &LirOp) -> bool {
    let LirOp::Xir(instance) = op else {
        return false;
    };
    instance
        .snippet
        .template
        .fast_path
        .iter()
        .chain(instance.snippet.template.slow_path.iter())
        .any(|x| matches!(x, XirOp::CallRuntime { .. }))
}

fn rewrite(lir: &mut Lir, assignments: &FxHashMap<VarId, Assignment>) {
    for list in &mut lir.lists {
        for op in &mut list.ops {
            op.for_each_operand_mut(|operand| {
                if let Operand::Var { id, kind } = operand {
                    match assignments.get(id) {
                        Some(Assignment::Reg(reg)) => {
                            *operand = Operand::Reg {
                                reg: *reg,
                                kind: *kind,
                            };
                        }
                        Some(Assignment::Stack(slot)) => {
                            *operand = Operand::Stack {
                                slot: *slot,
                                kind: *kind,
                                caller_frame: false,
                            };
                        }
                        None => {
                            // A variable with no occurrence counted must
                            // still be materialized somewhere; give it the
                            // scratch slot so emission stays well-formed.
                            *operand = Operand::Stack {
                                slot: 0,
                                kind: *kind,
                                caller_frame: false,
                            };
                        }
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::BlockId;
    use crate::lir::operand::OperandPool;
    use crate::lir::{BranchTarget, LirList, RuntimeCall};

    fn lir_with(pool: OperandPool, ops: Vec<LirOp>) -> Lir {
        let mut list = LirList::new(BlockId(0));
        for op in ops {
            list.push(op);
        }
        Lir {
            lists: vec![list],
            pool,
            order: vec![BlockId(0)],
            monitor_count: 0,
            stack_alloc_bytes: 0,
            outgoing_bytes: 0,
        }
    }

    #[test]
    fn test_simple_assignment_uses_registers() {
        let mut pool = OperandPool::new();
        let a = pool.new_variable(Kind::Int);
        let b = pool.new_variable(Kind::Int);
        let mut lir = lir_with(
            pool,
            vec![
                LirOp::Move {
                    src: Operand::Const(crate::value::ConstValue::Int(1)),
                    dst: a.clone(),
                },
                LirOp::Move {
                    src: a.clone(),
                    dst: b.clone(),
                },
                LirOp::Return { value: Some(b.clone()) },
            ],
        );
        let result = allocate(&mut lir, &Target::x64()).unwrap();
        assert_eq!(result.spill_slots, 1);
        for op in &lir.lists[0].ops {
            op.for_each_operand(|operand, _| {
                assert!(!operand.is_var(), "rewritten: {operand:?}");
            });
        }
    }

    #[test]
    fn test_fixed_binding_respected() {
        let mut pool = OperandPool::new();
        let fixed = pool.new_fixed(Kind::Int, Reg::Gpr(Gpr::Rax));
        let mut lir = lir_with(
            pool,
            vec![
                LirOp::Move {
                    src: Operand::Const(crate::value::ConstValue::Int(1)),
                    dst: fixed.clone(),
                },
                LirOp::Return { value: Some(fixed.clone()) },
            ],
        );
        allocate(&mut lir, &Target::x64()).unwrap();
        match &lir.lists[0].ops[0] {
            LirOp::Move { dst: Operand::Reg { reg, .. }, .. } => {
                assert_eq!(*reg, Reg::Gpr(Gpr::Rax));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_value_across_call_spills() {
        let mut pool = OperandPool::new();
        let a = pool.new_variable(Kind::Int);
        let b = pool.new_variable(Kind::Int);
        let mut lir = lir_with(
            pool,
            vec![
                LirOp::Move {
                    src: Operand::Const(crate::value::ConstValue::Int(1)),
                    dst: a.clone(),
                },
                LirOp::CallRuntime {
                    call: RuntimeCall::NanoTime,
                    args: vec![],
                    result: Operand::Illegal,
                    info: None,
                },
                LirOp::Move {
                    src: a.clone(),
                    dst: b.clone(),
                },
                LirOp::Return { value: Some(b.clone()) },
            ],
        );
        let result = allocate(&mut lir, &Target::x64()).unwrap();
        assert!(result.spill_slots > 1);
        // a lives across the call; it must be a frame slot now.
        match &lir.lists[0].ops[0] {
            LirOp::Move { dst, .. } => assert!(dst.is_stack(), "spilled across call: {dst:?}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_float_class_uses_xmm() {
        let mut pool = OperandPool::new();
        let f = pool.new_variable(Kind::Double);
        let mut lir = lir_with(
            pool,
            vec![
                LirOp::Move {
                    src: Operand::Const(crate::value::ConstValue::Double(1.0)),
                    dst: f.clone(),
                },
                LirOp::Return { value: Some(f.clone()) },
            ],
        );
        allocate(&mut lir, &Target::x64()).unwrap();
        match &lir.lists[0].ops[0] {
            LirOp::Move { dst: Operand::Reg { reg, .. }, .. } => {
                assert!(matches!(reg, Reg::Xmm(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_backward_branch_extends_interval() {
        // A value defined at 0 and read at 1, with a backward jump at 3 to
        // position 1: the interval must stretch past the loop.
        let mut pool = OperandPool::new();
        let a = pool.new_variable(Kind::Int);
        let b = pool.new_variable(Kind::Int);
        let mut block0 = LirList::new(BlockId(0));
        block0.push(LirOp::Move {
            src: Operand::Const(crate::value::ConstValue::Int(1)),
            dst: a.clone(),
        });
        block0.push(LirOp::Jump {
            target: BranchTarget::Block(BlockId(1)),
        });
        let mut block1 = LirList::new(BlockId(1));
        block1.push(LirOp::Move {
            src: a.clone(),
            dst: b.clone(),
        });
        block1.push(LirOp::Jump {
            target: BranchTarget::Block(BlockId(1)),
        });
        let lir = Lir {
            lists: vec![block0, block1],
            pool,
            order: vec![BlockId(0), BlockId(1)],
            monitor_count: 0,
            stack_alloc_bytes: 0,
            outgoing_bytes: 0,
        };
        let intervals = build_intervals(&lir);
        let ia = intervals.iter().find(|iv| Some(iv.var) == a.as_var()).unwrap();
        // The back edge is the jump at position 3; a's interval must reach it.
        assert_eq!(ia.end, 3);
    }
}
