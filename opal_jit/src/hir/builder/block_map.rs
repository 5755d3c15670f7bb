//! Basic-block discovery.
//!
//! One pass over the bytecode records a leader at every branch target,
//! exception-handler entry and fall-through after a branch. A second pass
//! marks loop headers (targets of backward branches) and collects the set
//! of locals stored inside each loop body, which later limits phi insertion
//! at loop headers to locals that can actually change.

use rustc_hash::FxHashSet;

use opal_core::bytecode::{opcodes::*, BytecodeStream};
use opal_core::{Bailout, CompileResult};

use crate::runtime::ExceptionHandler;

/// Leader, loop and store information for one method's bytecode.
#[derive(Debug)]
pub struct BlockMap {
    leaders: FxHashSet<u32>,
    loop_headers: FxHashSet<u32>,
    stores_in_loops: Vec<bool>,
}

impl BlockMap {
    /// Compute the map for a method.
    pub fn build(
        code: &[u8],
        handlers: &[ExceptionHandler],
        max_locals: usize,
    ) -> CompileResult<BlockMap> {
        if code.is_empty() {
            return Err(Bailout::malformed("empty bytecode"));
        }
        let stream = BytecodeStream::new(code);
        let mut leaders = FxHashSet::default();
        let mut loop_headers = FxHashSet::default();
        let mut stores_in_loops = vec![false; max_locals];
        // (branch bci, target bci) for every backward branch.
        let mut back_edges: Vec<(u32, u32)> = Vec::new();

        leaders.insert(0);
        for handler in handlers {
            leaders.insert(handler.handler_bci);
        }

        let mut bci = 0;
        while bci < stream.len() {
            let opcode = stream.byte_at(bci)?;
            let next = stream.next_bci(bci)?;
            match opcode {
                IFEQ..=IF_ACMPNE | IFNULL | IFNONNULL => {
                    let target = stream.branch_dest(bci)?;
                    leaders.insert(target);
                    leaders.insert(next);
                    if target <= bci {
                        loop_headers.insert(target);
                        back_edges.push((bci, target));
                    }
                }
                GOTO => {
                    let target = stream.branch_dest(bci)?;
                    leaders.insert(target);
                    if next < stream.len() {
                        leaders.insert(next);
                    }
                    if target <= bci {
                        loop_headers.insert(target);
                        back_edges.push((bci, target));
                    }
                }
                GOTO_W => {
                    let target = stream.far_branch_dest(bci)?;
                    leaders.insert(target);
                    if next < stream.len() {
                        leaders.insert(next);
                    }
                    if target <= bci {
                        loop_headers.insert(target);
                        back_edges.push((bci, target));
                    }
                }
                TABLESWITCH => {
                    let payload = stream.switch_payload(bci);
                    let default = stream.read_i32(payload)?;
                    let lo = stream.read_i32(payload + 4)?;
                    let hi = stream.read_i32(payload + 8)?;
                    let entries = (hi as i64 - lo as i64 + 1) as u32;
                    for i in 0..entries {
                        let delta = stream.read_i32(payload + 12 + i * 4)? as i64;
                        leaders.insert(checked_target(bci, delta, stream.len())?);
                    }
                    leaders.insert(checked_target(bci, default as i64, stream.len())?);
                    if next < stream.len() {
                        leaders.insert(next);
                    }
                }
                LOOKUPSWITCH => {
                    let payload = stream.switch_payload(bci);
                    let default = stream.read_i32(payload)?;
                    let npairs = stream.read_i32(payload + 4)? as u32;
                    for i in 0..npairs {
                        let delta = stream.read_i32(payload + 8 + i * 8 + 4)? as i64;
                        leaders.insert(checked_target(bci, delta, stream.len())?);
                    }
                    leaders.insert(checked_target(bci, default as i64, stream.len())?);
                    if next < stream.len() {
                        leaders.insert(next);
                    }
                }
                IRETURN..=RETURN | ATHROW => {
                    if next < stream.len() {
                        leaders.insert(next);
                    }
                }
                JSR | JSR_W | RET => {
                    return Err(Bailout::unsupported(opcode, bci));
                }
                _ => {}
            }
            bci = next;
        }

        // Any store whose bci lies inside a backward branch's span writes a
        // local the corresponding loop header must merge with a phi.
        for &(branch_bci, target_bci) in &back_edges {
            let mut bci = target_bci;
            while bci <= branch_bci {
                if let Some(local) = store_target(&stream, bci)? {
                    if (local as usize) < max_locals {
                        stores_in_loops[local as usize] = true;
                    }
                }
                bci = stream.next_bci(bci)?;
            }
        }

        Ok(BlockMap {
            leaders,
            loop_headers,
            stores_in_loops,
        })
    }

    /// Whether a bci starts a block.
    #[inline]
    pub fn is_leader(&self, bci: u32) -> bool {
        self.leaders.contains(&bci)
    }

    /// Whether a bci is a loop header.
    #[inline]
    pub fn is_loop_header(&self, bci: u32) -> bool {
        self.loop_headers.contains(&bci)
    }

    /// Whether a local is stored somewhere inside a loop body.
    #[inline]
    pub fn stores_in_loops(&self, local: usize) -> bool {
        self.stores_in_loops.get(local).copied().unwrap_or(false)
    }

    /// Leader bcis in ascending order.
    pub fn leaders_sorted(&self) -> Vec<u32> {
        let mut v: Vec<u32> = self.leaders.iter().copied().collect();
        v.sort_unstable();
        v
    }
}

fn checked_target(bci: u32, delta: i64, len: u32) -> CompileResult<u32> {
    let target = bci as i64 + delta;
    if target < 0 || target >= len as i64 {
        return Err(Bailout::malformed(format!(
            "switch at bci {bci} targets {target}, outside [0, {len})"
        )));
    }
    Ok(target as u32)
}

/// The local a store-like instruction writes, if it is one.
fn store_target(stream: &BytecodeStream<'_>, bci: u32) -> CompileResult<Option<u32>> {
    let opcode = stream.byte_at(bci)?;
    Ok(match opcode {
        ISTORE | LSTORE | FSTORE | DSTORE | ASTORE => Some(u32::from(stream.read_u8(bci + 1)?)),
        ISTORE_0..=ASTORE_3 => Some(u32::from((opcode - ISTORE_0) & 3)),
        IINC => Some(u32::from(stream.read_u8(bci + 1)?)),
        WIDE => {
            let modified = stream.byte_at(bci + 1)?;
            match modified {
                ISTORE | LSTORE | FSTORE | DSTORE | ASTORE | IINC => {
                    Some(u32::from(stream.read_u16(bci + 2)?))
                }
                _ => None,
            }
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_straight_line_has_single_leader() {
        let code = [ICONST_0, IRETURN];
        let map = BlockMap::build(&code, &[], 1).unwrap();
        assert!(map.is_leader(0));
        assert_eq!(map.leaders_sorted(), vec![0]);
        assert!(!map.is_loop_header(0));
    }

    #[test]
    fn test_branch_creates_target_and_fallthrough_leaders() {
        // 0: iload_0; 1: ifeq +5 (-> 6); 4: iconst_0; 5: ireturn; 6: iconst_1; 7: ireturn
        let code = [ILOAD_0, IFEQ, 0, 5, ICONST_0, IRETURN, ICONST_1, IRETURN];
        let map = BlockMap::build(&code, &[], 1).unwrap();
        assert_eq!(map.leaders_sorted(), vec![0, 4, 6]);
    }

    #[test]
    fn test_backward_branch_marks_loop_header_and_stores() {
        // A countdown loop:
        // 0: iload_0
        // 1: ifeq +9 (-> 10)
        // 4: iinc 0 by -1
        // 7: goto -6 (-> 1)  ... wait, target must be a leader; branch to 0
        // Using: 7: goto -7 (-> 0)
        // 10: return
        let code = [
            ILOAD_0,
            IFEQ,
            0,
            9,
            IINC,
            0,
            0xff,
            GOTO,
            0xff,
            (-7i8) as u8,
            RETURN,
        ];
        let map = BlockMap::build(&code, &[], 1).unwrap();
        assert!(map.is_loop_header(0));
        assert!(map.stores_in_loops(0));
        assert!(!map.stores_in_loops(1));
    }

    #[test]
    fn test_handler_entry_is_leader() {
        let code = [NOP, NOP, RETURN, ICONST_0, IRETURN];
        let handlers = [ExceptionHandler {
            start_bci: 0,
            end_bci: 2,
            handler_bci: 3,
            catch_type: None,
        }];
        let map = BlockMap::build(&code, &handlers, 0).unwrap();
        assert!(map.is_leader(3));
    }

    #[test]
    fn test_jsr_bails_out() {
        let code = [JSR, 0, 3, RETURN];
        assert!(matches!(
            BlockMap::build(&code, &[], 0),
            Err(Bailout::UnsupportedBytecode { opcode: JSR, .. })
        ));
    }

    #[test]
    fn test_empty_code_rejected() {
        assert!(BlockMap::build(&[], &[], 0).is_err());
    }
}
