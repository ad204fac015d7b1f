use super::{Cache, Id};
use crate::error::Error;
use crate::opcode::Opcode;

use std::collections::HashMap;

/// Lightweight handle to a root node within a [`Cache`]
///
/// A `Tree` is a plain value: copying it is free, and it stays valid for
/// as long as the cache keeps the node (i.e. until
/// [`Cache::reset`]).  Operations that need the node data borrow the
/// cache explicitly.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Tree {
    root: Id,
}

impl Tree {
    /// Builds a handle to the given root, checking that it exists
    pub fn new(cache: &Cache, root: Id) -> Result<Self, Error> {
        cache.node(root)?;
        Ok(Self { root })
    }

    /// Returns the root id
    pub fn root(&self) -> Id {
        self.root
    }

    /// Rewrites the tree so that no affine node remains
    ///
    /// Every `a·X + b·Y + c·Z + d` node is expanded into explicit
    /// multiply-and-add structure (terms with zero coefficients simplify
    /// away again), leaving only opcodes that the evaluator knows how to
    /// execute numerically.  Returns a handle to the rewritten root; the
    /// original tree is untouched.
    pub fn collapse(&self, cache: &mut Cache) -> Result<Tree, Error> {
        enum Action {
            /// Visit a node, scheduling `Up` after its children
            Down(Id),
            /// Rebuild a node from its remapped children
            Up(Id),
        }

        // An explicit stack, since a recursive walk would overflow on
        // deep trees
        let mut map: HashMap<Id, Id> = HashMap::new();
        let mut todo = vec![Action::Down(self.root)];
        while let Some(action) = todo.pop() {
            match action {
                Action::Down(id) => {
                    if map.contains_key(&id) {
                        continue;
                    }
                    let n = cache.node(id)?.clone();
                    match n.op {
                        Opcode::Const
                        | Opcode::VarX
                        | Opcode::VarY
                        | Opcode::VarZ => {
                            map.insert(id, id);
                        }
                        Opcode::Affine => {
                            let [a, b, c, d] = n.affine;
                            let out = cache.expand_affine(a, b, c, d)?;
                            map.insert(id, out);
                        }
                        _ => {
                            todo.push(Action::Up(id));
                            todo.extend(n.lhs.map(Action::Down));
                            todo.extend(n.rhs.map(Action::Down));
                        }
                    }
                }
                Action::Up(id) => {
                    let n = cache.node(id)?.clone();
                    let lhs = map[&n.lhs.unwrap()];
                    let rhs = n.rhs.map(|r| map[&r]);
                    let out = cache.rebuild(n.op, lhs, rhs)?;
                    map.insert(id, out);
                }
            }
        }
        Ok(Tree { root: map[&self.root] })
    }
}
