use std::collections::VecDeque;

use super::slot::Slot;

/// A run of consecutive slots inside one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    chunk: u32,
    first: u32,
    len: u32,
}

impl Block {
    pub(crate) fn new(chunk: usize, first: usize, len: usize) -> Self {
        Self {
            chunk: chunk as u32,
            first: first as u32,
            len: len as u32,
        }
    }

    pub fn chunk(&self) -> usize {
        self.chunk as usize
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, slot: Slot) -> bool {
        slot.chunk() == self.chunk()
            && slot.index() >= self.first as usize
            && slot.index() < (self.first + self.len) as usize
    }

    pub fn slots(&self) -> impl Iterator<Item = Slot> + '_ {
        let chunk = self.chunk();
        (self.first as usize..(self.first + self.len) as usize).map(move |i| Slot::new(chunk, i))
    }
}

/// Ordered list of whole blocks.
#[derive(Debug, Default)]
pub struct BlockList {
    blocks: VecDeque<Block>,
}

impl BlockList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn slot_count(&self) -> usize {
        self.blocks.iter().map(Block::len).sum()
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push_back(block);
    }

    pub fn extend(&mut self, blocks: impl IntoIterator<Item = Block>) {
        self.blocks.extend(blocks);
    }

    /// Take up to `count` blocks from the front.
    pub fn take(&mut self, count: usize) -> Vec<Block> {
        let count = count.min(self.blocks.len());
        self.blocks.drain(..count).collect()
    }

    pub fn drain(&mut self) -> Vec<Block> {
        self.blocks.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }
}

/// Ordered chain of loose slots, possibly spanning several chunks.
#[derive(Debug, Default)]
pub struct Link {
    slots: VecDeque<Slot>,
}

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn push_front(&mut self, slot: Slot) {
        self.slots.push_front(slot);
    }

    pub fn push_back(&mut self, slot: Slot) {
        self.slots.push_back(slot);
    }

    pub fn pop_front(&mut self) -> Option<Slot> {
        self.slots.pop_front()
    }

    pub fn extend(&mut self, slots: impl IntoIterator<Item = Slot>) {
        self.slots.extend(slots);
    }

    /// Take up to `count` slots from the front; fewer when the link runs short.
    pub fn take(&mut self, count: usize) -> Vec<Slot> {
        let count = count.min(self.slots.len());
        self.slots.drain(..count).collect()
    }

    pub fn drain(&mut self) -> Vec<Slot> {
        self.slots.drain(..).collect()
    }

    pub fn contains(&self, slot: Slot) -> bool {
        self.slots.contains(&slot)
    }

    /// Remove every slot of `block`, returning whether all of them were present.
    pub fn remove_block(&mut self, block: &Block) -> bool {
        let before = self.slots.len();
        self.slots.retain(|s| !block.contains(*s));
        before - self.slots.len() == block.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_enumerates_its_slots() {
        let block = Block::new(2, 4, 3);
        let slots: Vec<_> = block.slots().collect();
        assert_eq!(
            slots,
            vec![Slot::new(2, 4), Slot::new(2, 5), Slot::new(2, 6)]
        );
        assert!(block.contains(Slot::new(2, 6)));
        assert!(!block.contains(Slot::new(2, 7)));
        assert!(!block.contains(Slot::new(1, 4)));
    }

    #[test]
    fn block_list_take_is_partial() {
        let mut list = BlockList::new();
        list.push(Block::new(0, 0, 4));
        list.push(Block::new(1, 0, 4));
        assert_eq!(list.slot_count(), 8);

        let taken = list.take(5);
        assert_eq!(taken.len(), 2);
        assert!(list.is_empty());
    }

    #[test]
    fn link_take_spans_chunks() {
        let mut link = Link::new();
        link.extend(Block::new(0, 0, 2).slots());
        link.extend(Block::new(1, 0, 2).slots());

        let taken = link.take(3);
        assert_eq!(taken, vec![Slot::new(0, 0), Slot::new(0, 1), Slot::new(1, 0)]);
        assert_eq!(link.len(), 1);
        assert_eq!(link.take(10), vec![Slot::new(1, 1)]);
        assert!(link.take(1).is_empty());
    }

    #[test]
    fn remove_block_reports_completeness() {
        let block = Block::new(0, 0, 2);
        let mut link = Link::new();
        link.push_back(Slot::new(0, 0));
        link.push_back(Slot::new(0, 9));
        assert!(!link.remove_block(&block));
        assert_eq!(link.len(), 1);

        link.extend(block.slots());
        assert!(link.remove_block(&block));
    }
}
