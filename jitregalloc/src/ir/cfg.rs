//! Control flow graph utilities.

use super::{BlockIdx, Function};
use vob::Vob;

impl Function {
    /// The blocks reachable from the entry, in postorder.
    pub fn postorder(&self) -> Vec<BlockIdx> {
        let mut order = Vec::with_capacity(self.blocks.len());
        if self.blocks.is_empty() {
            return order;
        }
        let mut seen = Vob::from_elem(false, self.blocks.len());
        // Each stack entry is a block and the index of the next successor to visit.
        let mut stack = vec![(BlockIdx::from_usize(0), 0)];
        seen.set(0, true);
        while let Some((b, i)) = stack.last_mut() {
            let b = *b;
            if let Some(succ) = self.blocks[b].succs.get(*i).copied() {
                *i += 1;
                if !seen[succ.index()] {
                    seen.set(succ.index(), true);
                    stack.push((succ, 0));
                }
            } else {
                order.push(b);
                stack.pop();
            }
        }
        order
    }

    /// The blocks reachable from the entry, in reverse postorder. This is the linear order the
    /// allocators number instructions in.
    pub fn reverse_postorder(&self) -> Vec<BlockIdx> {
        let mut order = self.postorder();
        order.reverse();
        order
    }

    /// Split the edge `from -> to` by synthesising a new, empty block between them. The new block
    /// takes `from`'s place in `to`'s predecessor list and `to`'s place in `from`'s successor list,
    /// so neither phi source order nor branch targets change meaning.
    ///
    /// # Panics
    ///
    /// If there is no edge `from -> to`.
    pub fn split_edge(&mut self, from: BlockIdx, to: BlockIdx) -> BlockIdx {
        let new = self.add_block();
        let sidx = self.blocks[from]
            .succs
            .iter()
            .position(|x| *x == to)
            .unwrap_or_else(|| panic!("No edge bb{} -> bb{}", from.index(), to.index()));
        self.blocks[from].succs[sidx] = new;
        let pidx = self.blocks[to]
            .preds
            .iter()
            .position(|x| *x == from)
            .unwrap_or_else(|| panic!("No edge bb{} -> bb{}", from.index(), to.index()));
        self.blocks[to].preds[pidx] = new;
        self.blocks[new].preds.push(from);
        self.blocks[new].succs.push(to);
        new
    }
}

#[cfg(test)]
mod tests {
    use crate::ir::{str_to_func, BlockIdx};

    #[test]
    fn orders() {
        let f = str_to_func(
            "
          bb0 -> bb1, bb2:
            branch_if 1
          bb1 -> bb3:
            branch
          bb2 -> bb3:
            branch
          bb3 -> bb1:
            branch
          bb4:
            return
        ",
        );
        let b = |i| BlockIdx::from_usize(i);
        assert_eq!(f.postorder(), vec![b(3), b(1), b(2), b(0)]);
        assert_eq!(f.reverse_postorder(), vec![b(0), b(2), b(1), b(3)]);
    }

    #[test]
    fn split_edge() {
        let mut f = str_to_func(
            "
          bb0 -> bb2, bb1:
            branch_if 1
          bb1 -> bb2:
            branch
          bb2:
            %0: i64 = phi 1, 2
            return
        ",
        );
        let b = |i| BlockIdx::from_usize(i);
        let new = f.split_edge(b(0), b(2));
        assert_eq!(new, b(3));
        assert_eq!(f.block(b(0)).succs(), &[new, b(1)]);
        assert_eq!(f.block(b(2)).preds(), &[new, b(1)]);
        assert_eq!(f.block(new).preds(), &[b(0)]);
        assert_eq!(f.block(new).succs(), &[b(2)]);
        assert!(f.block(new).is_empty());
    }
}
