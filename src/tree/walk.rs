use std::rc::Rc;

use crate::error::Result;
use crate::pager::{PageId, Pager};

use super::page::{Child, TreePage};
use super::TreePos;

/// One item reached by a [`TreeWalk`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    /// Segments from the root down to this item.
    pub path: Vec<String>,
    /// Position of the item.
    pub pos: TreePos,
    /// Row id of the item; zero or less means none.
    pub row_id: i32,
    /// Whether the item has a child record.
    pub has_children: bool,
}

struct Frame {
    page: Rc<TreePage>,
    record: usize,
    next: usize,
    depth: usize,
}

/// Depth-first iterator over every item of a tree, lexicographic within a
/// record. Continuation items are crossed transparently. Iteration stops
/// after the first error.
pub struct TreeWalk<'p> {
    pager: &'p mut Pager,
    item_payload: usize,
    stack: Vec<Frame>,
    path: Vec<String>,
    pending_root: Option<PageId>,
}

impl<'p> TreeWalk<'p> {
    pub(crate) fn new(pager: &'p mut Pager, root: PageId, item_payload: usize) -> Self {
        Self {
            pager,
            item_payload,
            stack: Vec::new(),
            path: Vec::new(),
            pending_root: Some(root),
        }
    }

    fn push_page(&mut self, page_id: PageId, record: usize, depth: usize) -> Result<()> {
        let image = self.pager.read_page(page_id)?;
        let page = TreePage::decode(self.pager, page_id, &image, self.item_payload)?;
        self.push_record(Rc::new(page), record, depth);
        Ok(())
    }

    fn push_record(&mut self, page: Rc<TreePage>, record: usize, depth: usize) {
        if page.records.len() > record {
            self.stack.push(Frame {
                page,
                record,
                next: 0,
                depth,
            });
        }
    }

    fn advance(&mut self) -> Result<Option<TreeEntry>> {
        if let Some(root) = self.pending_root.take() {
            self.push_page(root, 0, 0)?;
        }
        loop {
            let (page, record, depth, index) = {
                let Some(frame) = self.stack.last_mut() else {
                    return Ok(None);
                };
                if frame.next >= frame.page.records[frame.record].items.len() {
                    self.stack.pop();
                    continue;
                }
                let index = frame.next;
                frame.next += 1;
                (Rc::clone(&frame.page), frame.record, frame.depth, index)
            };
            let item = &page.records[record].items[index];
            let child = item.child();

            if item.is_continuation() {
                if let Child::Page(next) = child {
                    self.push_page(next, 0, depth)?;
                }
                continue;
            }

            self.path.truncate(depth);
            self.path.push(item.name.clone());
            let entry = TreeEntry {
                path: self.path.clone(),
                pos: TreePos::new(page.id, record, index)?,
                row_id: item.row_id,
                has_children: child != Child::None,
            };
            match child {
                Child::None => {}
                Child::Record(rec) => self.push_record(page, rec as usize, depth + 1),
                Child::Page(next) => self.push_page(next, 0, depth + 1)?,
            }
            return Ok(Some(entry));
        }
    }
}

impl Iterator for TreeWalk<'_> {
    type Item = Result<TreeEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(err) => {
                self.stack.clear();
                Some(Err(err))
            }
        }
    }
}
