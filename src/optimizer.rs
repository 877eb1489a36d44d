/// Offset stabilization for the hunk stream.
///
/// Branch and call opcodes have a one-byte and a two-byte displacement
/// form.  The shrink phase repeatedly reassigns offsets, letting
/// transfers with reachable, defined targets claim the short form, until
/// the total length stops decreasing.  The stabilize phase then freezes
/// the chosen forms and reassigns offsets to a fixed point.

use crate::anode::AsmGraph;

pub fn optimize_hunk(g: &mut AsmGraph, no_shrink: bool) {
    let hunk = g.hunk.list;

    if !no_shrink {
        g.shrink = true;
        let mut cur = g.set_list_offset(hunk, 0);
        loop {
            let next = g.set_list_offset(hunk, 0);
            if next >= cur {
                cur = next;
                break;
            }
            cur = next;
        }
        let _ = cur;
    }

    // Stabilize: no further shrinking; iterate until the length is a
    // fixed point.
    g.shrink = false;
    let mut cur = g.set_list_offset(hunk, 0);
    loop {
        let next = g.set_list_offset(hunk, 0);
        if next == cur {
            break;
        }
        cur = next;
    }

    g.hunk.fix_ofs = cur;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anode::*;
    use crate::bytecode::*;

    /// Filler of `n` one-byte opcodes.
    fn pad(g: &mut AsmGraph, n: usize) {
        for _ in 0..n {
            g.push_op(OP_PUSH);
        }
    }

    #[test]
    fn near_branches_shrink_and_stay_shrunk() {
        let mut g = AsmGraph::new();
        g.open_stream(Stream::Hunk);

        let b = g.push(AsmKind::Branch {
            op: OP_JMP,
            reference: Reference::new(),
        });
        pad(&mut g, 10);
        let lab = g.new_label_node();
        g.set_target(b, lab);

        optimize_hunk(&mut g, false);
        let long = 3 + 10;
        assert_eq!(g.hunk.fix_ofs, long - 1, "short form saves one byte");

        // Invariant: one more offset pass is a no-op.
        let len = g.set_list_offset(g.hunk.list, 0);
        assert_eq!(len, g.hunk.fix_ofs);
    }

    #[test]
    fn far_branches_keep_the_long_form() {
        let mut g = AsmGraph::new();
        g.open_stream(Stream::Hunk);

        let b = g.push(AsmKind::Branch {
            op: OP_JMP,
            reference: Reference::new(),
        });
        pad(&mut g, 200);
        let lab = g.new_label_node();
        g.set_target(b, lab);

        optimize_hunk(&mut g, false);
        assert_eq!(g.hunk.fix_ofs, 3 + 200);
    }

    #[test]
    fn shrink_phase_can_be_disabled() {
        let mut g = AsmGraph::new();
        g.open_stream(Stream::Hunk);

        let b = g.push(AsmKind::Branch {
            op: OP_JMP,
            reference: Reference::new(),
        });
        pad(&mut g, 4);
        let lab = g.new_label_node();
        g.set_target(b, lab);

        optimize_hunk(&mut g, true);
        assert_eq!(g.hunk.fix_ofs, 3 + 4);
    }

    #[test]
    fn cascading_shrinks_converge() {
        // Two forward branches where shrinking the first pulls the second
        // target into range.
        let mut g = AsmGraph::new();
        g.open_stream(Stream::Hunk);

        let b1 = g.push(AsmKind::Branch {
            op: OP_JMP,
            reference: Reference::new(),
        });
        pad(&mut g, 120);
        let b2 = g.push(AsmKind::Branch {
            op: OP_JMP,
            reference: Reference::new(),
        });
        pad(&mut g, 6);
        let lab = g.new_label_node();
        g.set_target(b1, lab);
        g.set_target(b2, lab);

        optimize_hunk(&mut g, false);
        // Both end up short: 2 + 120 + 2 + 6.
        assert_eq!(g.hunk.fix_ofs, 130);

        let again = g.set_list_offset(g.hunk.list, 0);
        assert_eq!(again, g.hunk.fix_ofs);
    }
}
