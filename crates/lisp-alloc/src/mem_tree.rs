//! Address classifier.
//!
//! A red-black tree of the address ranges the heap has obtained from the
//! system, each tagged with the kind of Lisp data it holds. Conservative
//! stack scanning asks it whether a word falls inside any heap block and,
//! if so, which liveness predicate to apply.
//!
//! Nodes live in a `Vec` and link to each other by index. Index 0 is the
//! black sentinel that stands for every leaf.

/// Kind of memory a registered range holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemType {
    /// A block of pair cells.
    Cons,
    /// A block of string header cells.
    String,
    /// A block of marker and overlay cells.
    Misc,
    /// A block of symbol cells.
    Symbol,
    /// A block of float cells.
    Float,
    /// A vector allocated on its own.
    Vectorlike,
    /// A shared block holding several small vectors.
    VectorBlock,
    /// A buffer.
    Buffer,
    /// The spare memory reserve.
    Spare,
}

/// A registered range, as returned by [`MemTree::find`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemEntry {
    /// First address of the range.
    pub start: usize,
    /// One past the last address of the range.
    pub end: usize,
    /// What the range holds.
    pub mem_type: MemType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

#[derive(Debug, Clone, Copy)]
struct MemNode {
    start: usize,
    end: usize,
    mem_type: MemType,
    color: Color,
    left: usize,
    right: usize,
    parent: usize,
}

const MEM_NIL: usize = 0;

const SENTINEL: MemNode = MemNode {
    start: 0,
    end: 0,
    mem_type: MemType::Spare,
    color: Color::Black,
    left: MEM_NIL,
    right: MEM_NIL,
    parent: MEM_NIL,
};

/// Red-black tree mapping address ranges to [`MemType`]s.
#[derive(Debug)]
pub struct MemTree {
    nodes: Vec<MemNode>,
    root: usize,
    free_nodes: Vec<usize>,
    len: usize,
    min_address: usize,
    max_address: usize,
}

impl MemTree {
    /// An empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![SENTINEL],
            root: MEM_NIL,
            free_nodes: Vec::new(),
            len: 0,
            min_address: usize::MAX,
            max_address: 0,
        }
    }

    /// Number of registered ranges.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True if no range is registered.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The range containing `addr`, if any.
    #[must_use]
    pub fn find(&self, addr: usize) -> Option<MemEntry> {
        if addr < self.min_address || addr >= self.max_address {
            return None;
        }
        let mut x = self.root;
        while x != MEM_NIL {
            let node = &self.nodes[x];
            if addr < node.start {
                x = node.left;
            } else if addr >= node.end {
                x = node.right;
            } else {
                return Some(MemEntry {
                    start: node.start,
                    end: node.end,
                    mem_type: node.mem_type,
                });
            }
        }
        None
    }

    /// Register `[start, end)` as holding `mem_type`.
    ///
    /// Ranges must not overlap; debug builds panic if they do.
    pub fn insert(&mut self, start: usize, end: usize, mem_type: MemType) {
        assert!(start < end, "empty memory range");
        self.min_address = self.min_address.min(start);
        self.max_address = self.max_address.max(end);

        let mut parent = MEM_NIL;
        let mut c = self.root;
        while c != MEM_NIL {
            let node = &self.nodes[c];
            debug_assert!(
                end <= node.start || start >= node.end,
                "memory range {start:#x}..{end:#x} overlaps {:#x}..{:#x}",
                node.start,
                node.end
            );
            parent = c;
            c = if start < node.start { node.left } else { node.right };
        }

        let node = MemNode {
            start,
            end,
            mem_type,
            color: Color::Red,
            left: MEM_NIL,
            right: MEM_NIL,
            parent,
        };
        let x = if let Some(slot) = self.free_nodes.pop() {
            self.nodes[slot] = node;
            slot
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        };

        if parent == MEM_NIL {
            self.root = x;
        } else if start < self.nodes[parent].start {
            self.nodes[parent].left = x;
        } else {
            self.nodes[parent].right = x;
        }
        self.len += 1;
        self.insert_fixup(x);
    }

    /// Unregister the range starting at `start`, returning its type.
    pub fn remove(&mut self, start: usize) -> Option<MemType> {
        let mut z = self.root;
        while z != MEM_NIL && self.nodes[z].start != start {
            z = if start < self.nodes[z].start {
                self.nodes[z].left
            } else {
                self.nodes[z].right
            };
        }
        if z == MEM_NIL {
            return None;
        }
        let mem_type = self.nodes[z].mem_type;
        self.delete(z);
        Some(mem_type)
    }

    /// All registered ranges in address order.
    #[must_use]
    pub fn entries(&self) -> Vec<MemEntry> {
        let mut out = Vec::with_capacity(self.len);
        let mut stack = Vec::new();
        let mut x = self.root;
        while x != MEM_NIL || !stack.is_empty() {
            while x != MEM_NIL {
                stack.push(x);
                x = self.nodes[x].left;
            }
            if let Some(n) = stack.pop() {
                let node = &self.nodes[n];
                out.push(MemEntry {
                    start: node.start,
                    end: node.end,
                    mem_type: node.mem_type,
                });
                x = node.right;
            }
        }
        out
    }

    // ========================================================================
    // Node accessors
    // ========================================================================

    fn left(&self, x: usize) -> usize {
        self.nodes[x].left
    }

    fn right(&self, x: usize) -> usize {
        self.nodes[x].right
    }

    fn parent(&self, x: usize) -> usize {
        self.nodes[x].parent
    }

    fn color(&self, x: usize) -> Color {
        self.nodes[x].color
    }

    fn set_color(&mut self, x: usize, color: Color) {
        self.nodes[x].color = color;
    }

    // ========================================================================
    // Rebalancing
    // ========================================================================

    /*   (x)                   (y)
         / \                   / \
        a   (y)      ===>    (x)  c
            / \              / \
           b   c            a   b  */
    fn rotate_left(&mut self, x: usize) {
        let y = self.right(x);
        let b = self.left(y);
        self.nodes[x].right = b;
        if b != MEM_NIL {
            self.nodes[b].parent = x;
        }
        let xp = self.parent(x);
        self.nodes[y].parent = xp;
        if xp == MEM_NIL {
            self.root = y;
        } else if x == self.left(xp) {
            self.nodes[xp].left = y;
        } else {
            self.nodes[xp].right = y;
        }
        self.nodes[y].left = x;
        self.nodes[x].parent = y;
    }

    /*     (x)                (y)
           / \                / \
         (y)  c      ===>    a  (x)
         / \                    / \
        a   b                  b   c  */
    fn rotate_right(&mut self, x: usize) {
        let y = self.left(x);
        let b = self.right(y);
        self.nodes[x].left = b;
        if b != MEM_NIL {
            self.nodes[b].parent = x;
        }
        let xp = self.parent(x);
        self.nodes[y].parent = xp;
        if xp == MEM_NIL {
            self.root = y;
        } else if x == self.right(xp) {
            self.nodes[xp].right = y;
        } else {
            self.nodes[xp].left = y;
        }
        self.nodes[y].right = x;
        self.nodes[x].parent = y;
    }

    fn insert_fixup(&mut self, mut x: usize) {
        while self.color(self.parent(x)) == Color::Red {
            let p = self.parent(x);
            let g = self.parent(p);
            if p == self.left(g) {
                let uncle = self.right(g);
                if self.color(uncle) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(g, Color::Red);
                    x = g;
                } else {
                    if x == self.right(p) {
                        x = p;
                        self.rotate_left(x);
                    }
                    let p = self.parent(x);
                    let g = self.parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.rotate_right(g);
                }
            } else {
                let uncle = self.left(g);
                if self.color(uncle) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(g, Color::Red);
                    x = g;
                } else {
                    if x == self.left(p) {
                        x = p;
                        self.rotate_right(x);
                    }
                    let p = self.parent(x);
                    let g = self.parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.rotate_left(g);
                }
            }
        }
        let root = self.root;
        self.set_color(root, Color::Black);
    }

    fn transplant(&mut self, u: usize, v: usize) {
        let up = self.parent(u);
        if up == MEM_NIL {
            self.root = v;
        } else if u == self.left(up) {
            self.nodes[up].left = v;
        } else {
            self.nodes[up].right = v;
        }
        self.nodes[v].parent = up;
    }

    fn delete(&mut self, z: usize) {
        let mut removed_color = self.color(z);
        let x;
        if self.left(z) == MEM_NIL {
            x = self.right(z);
            self.transplant(z, x);
        } else if self.right(z) == MEM_NIL {
            x = self.left(z);
            self.transplant(z, x);
        } else {
            let mut y = self.right(z);
            while self.left(y) != MEM_NIL {
                y = self.left(y);
            }
            removed_color = self.color(y);
            x = self.right(y);
            if self.parent(y) == z {
                self.nodes[x].parent = y;
            } else {
                self.transplant(y, x);
                let zr = self.right(z);
                self.nodes[y].right = zr;
                self.nodes[zr].parent = y;
            }
            self.transplant(z, y);
            let zl = self.left(z);
            self.nodes[y].left = zl;
            self.nodes[zl].parent = y;
            let zc = self.color(z);
            self.set_color(y, zc);
        }
        if removed_color == Color::Black {
            self.delete_fixup(x);
        }

        self.nodes[z] = SENTINEL;
        self.free_nodes.push(z);
        self.len -= 1;
        // The sentinel's parent is scratch space during deletion.
        self.nodes[MEM_NIL].parent = MEM_NIL;
    }

    fn delete_fixup(&mut self, mut x: usize) {
        while x != self.root && self.color(x) == Color::Black {
            let xp = self.parent(x);
            if x == self.left(xp) {
                let mut w = self.right(xp);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(xp, Color::Red);
                    self.rotate_left(xp);
                    w = self.right(self.parent(x));
                }
                if self.color(self.left(w)) == Color::Black
                    && self.color(self.right(w)) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = self.parent(x);
                } else {
                    if self.color(self.right(w)) == Color::Black {
                        let wl = self.left(w);
                        self.set_color(wl, Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_right(w);
                        w = self.right(self.parent(x));
                    }
                    let xp = self.parent(x);
                    let pc = self.color(xp);
                    self.set_color(w, pc);
                    self.set_color(xp, Color::Black);
                    let wr = self.right(w);
                    self.set_color(wr, Color::Black);
                    self.rotate_left(xp);
                    x = self.root;
                }
            } else {
                let mut w = self.left(xp);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(xp, Color::Red);
                    self.rotate_right(xp);
                    w = self.left(self.parent(x));
                }
                if self.color(self.right(w)) == Color::Black
                    && self.color(self.left(w)) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = self.parent(x);
                } else {
                    if self.color(self.left(w)) == Color::Black {
                        let wr = self.right(w);
                        self.set_color(wr, Color::Black);
                        self.set_color(w, Color::Red);
                        self.rotate_left(w);
                        w = self.left(self.parent(x));
                    }
                    let xp = self.parent(x);
                    let pc = self.color(xp);
                    self.set_color(w, pc);
                    self.set_color(xp, Color::Black);
                    let wl = self.left(w);
                    self.set_color(wl, Color::Black);
                    self.rotate_right(xp);
                    x = self.root;
                }
            }
        }
        self.set_color(x, Color::Black);
    }

    /// Check the red-black properties and return the black height.
    #[cfg(test)]
    fn check_invariants(&self) -> usize {
        assert_eq!(self.color(MEM_NIL), Color::Black, "sentinel must stay black");
        assert_eq!(self.color(self.root), Color::Black, "root must be black");
        if self.root != MEM_NIL {
            assert_eq!(self.parent(self.root), MEM_NIL);
        }
        let height = self.check_subtree(self.root, 0, usize::MAX);
        assert_eq!(self.entries().len(), self.len);
        height
    }

    #[cfg(test)]
    fn check_subtree(&self, x: usize, lo: usize, hi: usize) -> usize {
        if x == MEM_NIL {
            return 1;
        }
        let node = &self.nodes[x];
        assert!(node.start >= lo && node.end <= hi, "ranges out of order");
        if node.color == Color::Red {
            assert_eq!(self.color(node.left), Color::Black, "red node with red child");
            assert_eq!(self.color(node.right), Color::Black, "red node with red child");
        }
        for child in [node.left, node.right] {
            if child != MEM_NIL {
                assert_eq!(self.parent(child), x, "broken parent link");
            }
        }
        let lh = self.check_subtree(node.left, lo, node.start);
        let rh = self.check_subtree(node.right, node.end, hi);
        assert_eq!(lh, rh, "unequal black heights");
        lh + usize::from(node.color == Color::Black)
    }
}

impl Default for MemTree {
    fn default() -> Self {
        Self::new()
    }
}
