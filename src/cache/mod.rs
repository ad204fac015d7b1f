//! Hash-consed storage for expression DAGs
//!
//! A [`Cache`] deduplicates every node it stores: inserting the same
//! operation twice returns the same [`Id`], and commutative operations are
//! normalized by operand order first.  Insertion also applies a fixed set
//! of algebraic identities, folds constant subtrees, and promotes sums and
//! scalings of the axis variables into a single affine node.
//!
//! Node storage is append-only; ids stay valid until [`Cache::reset`].
mod tree;
pub use tree::Tree;

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader, Read};
use std::num::NonZeroU32;
use std::str::FromStr;

use crate::error::Error;
use crate::opcode::Opcode;

/// Unique handle to a node stored in a [`Cache`]
///
/// Ids are only meaningful for the cache that created them.  The niche in
/// `NonZeroU32` keeps `Option<Id>` the same size as `Id`, which is how
/// absent operands are represented.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Id(NonZeroU32);

impl Id {
    fn new(index: usize) -> Self {
        Self(NonZeroU32::new(index as u32 + 1).unwrap())
    }
    fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

/// Deduplication key for a single node
///
/// The derived `Ord` doubles as the evaluator's enumeration order:
/// ascending rank first, and `Const` before the other rank-0 opcodes, so
/// a linear scan sees constants, then variables, then every compound
/// clause after its operands.
///
/// Float payloads are keyed by bit pattern (with NaNs canonicalized), so
/// `0.0` and `-0.0` deliberately get distinct constant nodes while all
/// NaNs share one.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct Key {
    pub rank: u32,
    pub op: Opcode,
    /// Bit pattern of the constant payload; 0 for other opcodes
    pub value: u32,
    /// Bit patterns of the affine coefficients; zeros for other opcodes
    pub affine: [u32; 4],
    pub lhs: Option<Id>,
    pub rhs: Option<Id>,
}

/// Stored data for a single node
#[derive(Clone, Debug)]
pub(crate) struct NodeData {
    pub op: Opcode,
    /// Constant payload (NaN unless `op` is `Const`)
    pub value: f32,
    /// Affine coefficients (only meaningful for `Affine`)
    pub affine: [f32; 4],
    pub lhs: Option<Id>,
    pub rhs: Option<Id>,
    /// Longest path to a leaf; leaves are rank 0
    pub rank: u32,
}

fn canonical_bits(f: f32) -> u32 {
    if f.is_nan() {
        f32::NAN.to_bits()
    } else {
        f.to_bits()
    }
}

/// A `Cache` holds a set of deduplicated constants, variables, and
/// operations.
///
/// It should be used like an arena allocator: it grows over time, then
/// frees all of its contents when dropped (or on [`reset`](Self::reset)).
/// Worker threads that need their own copy can simply clone it.
#[derive(Clone, Debug, Default)]
pub struct Cache {
    nodes: Vec<NodeData>,
    keys: BTreeMap<Key, Id>,
}

impl Cache {
    /// Builds a new empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of nodes in the cache
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Checks whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Discards every node
    ///
    /// All [`Id`] handles into this cache are invalidated; the caller must
    /// ensure that no live evaluator still reads from it.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.keys.clear();
    }

    pub(crate) fn node(&self, id: Id) -> Result<&NodeData, Error> {
        self.nodes.get(id.index()).ok_or(Error::CacheInvalidated)
    }

    /// Looks up the opcode of the given node
    pub fn opcode(&self, id: Id) -> Option<Opcode> {
        self.nodes.get(id.index()).map(|n| n.op)
    }

    /// Looks up the constant associated with the given node
    ///
    /// Returns `Ok(None)` if the node is valid but not a constant.
    pub fn const_value(&self, id: Id) -> Result<Option<f32>, Error> {
        let n = self.node(id)?;
        Ok(if n.op == Opcode::Const {
            Some(n.value)
        } else {
            None
        })
    }

    /// Looks up the affine coefficients `[a, b, c, d]` of the given node
    ///
    /// Returns `Ok(None)` if the node is valid but not an affine form.
    pub fn get_affine(&self, id: Id) -> Result<Option<[f32; 4]>, Error> {
        let n = self.node(id)?;
        Ok(if n.op == Opcode::Affine {
            Some(n.affine)
        } else {
            None
        })
    }

    /// Iterates over `(key, id)` pairs in enumeration order: constants
    /// first, then ascending rank
    pub(crate) fn iter_keys(&self) -> impl Iterator<Item = (&Key, Id)> {
        self.keys.iter().map(|(k, &id)| (k, id))
    }

    ////////////////////////////////////////////////////////////////////////
    // Storage primitives

    fn key_of(data: &NodeData) -> Key {
        Key {
            rank: data.rank,
            op: data.op,
            value: if data.op == Opcode::Const {
                canonical_bits(data.value)
            } else {
                0
            },
            affine: if data.op == Opcode::Affine {
                data.affine.map(canonical_bits)
            } else {
                [0; 4]
            },
            lhs: data.lhs,
            rhs: data.rhs,
        }
    }

    /// Inserts a node, returning the existing id if it is a duplicate
    fn insert(&mut self, data: NodeData) -> Id {
        let key = Self::key_of(&data);
        if let Some(&id) = self.keys.get(&key) {
            return id;
        }
        let id = Id::new(self.nodes.len());
        self.keys.insert(key, id);
        self.nodes.push(data);
        id
    }

    /// Erases the most recently added node
    ///
    /// Only used to delete temporary operation nodes during constant
    /// folding; such nodes are guaranteed to be unique (operations on
    /// constants are never stored persistently), so the most recent node
    /// is always the one just inserted.
    fn pop(&mut self) {
        let data = self.nodes.pop().expect("pop on an empty cache");
        self.keys.remove(&Self::key_of(&data));
    }

    fn insert_leaf(&mut self, op: Opcode) -> Id {
        self.insert(NodeData {
            op,
            value: f32::NAN,
            affine: [0.0; 4],
            lhs: None,
            rhs: None,
            rank: 0,
        })
    }

    fn insert_op(&mut self, op: Opcode, lhs: Id, rhs: Option<Id>) -> Id {
        let mut rank = self.nodes[lhs.index()].rank;
        if let Some(rhs) = rhs {
            rank = rank.max(self.nodes[rhs.index()].rank);
        }
        self.insert(NodeData {
            op,
            value: f32::NAN,
            affine: [0.0; 4],
            lhs: Some(lhs),
            rhs,
            rank: rank + 1,
        })
    }

    ////////////////////////////////////////////////////////////////////////
    // Primitives

    /// Constructs or finds the X axis variable
    pub fn x(&mut self) -> Id {
        self.insert_leaf(Opcode::VarX)
    }

    /// Constructs or finds the Y axis variable
    pub fn y(&mut self) -> Id {
        self.insert_leaf(Opcode::VarY)
    }

    /// Constructs or finds the Z axis variable
    pub fn z(&mut self) -> Id {
        self.insert_leaf(Opcode::VarZ)
    }

    /// Returns a 3-element array of `X`, `Y`, `Z` nodes
    pub fn axes(&mut self) -> [Id; 3] {
        [self.x(), self.y(), self.z()]
    }

    /// Returns a node representing the given constant value
    ///
    /// Constants are coalesced by bit pattern: `0.0` and `-0.0` are
    /// distinct nodes, while every NaN shares a single node.
    pub fn constant(&mut self, f: f32) -> Id {
        self.insert(NodeData {
            op: Opcode::Const,
            value: f,
            affine: [0.0; 4],
            lhs: None,
            rhs: None,
            rank: 0,
        })
    }

    /// Returns a node representing `a·X + b·Y + c·Z + d`
    ///
    /// Collapses to a plain constant when `a`, `b`, and `c` are all zero.
    pub fn affine(&mut self, a: f32, b: f32, c: f32, d: f32) -> Id {
        if a == 0.0 && b == 0.0 && c == 0.0 {
            return self.constant(d);
        }
        self.insert(NodeData {
            op: Opcode::Affine,
            value: f32::NAN,
            affine: [a, b, c, d],
            lhs: None,
            rhs: None,
            rank: 0,
        })
    }

    /// Views a node as an affine form, if it can be one
    fn as_affine(&self, id: Id) -> Option<[f32; 4]> {
        let n = self.nodes.get(id.index())?;
        match n.op {
            Opcode::VarX => Some([1.0, 0.0, 0.0, 0.0]),
            Opcode::VarY => Some([0.0, 1.0, 0.0, 0.0]),
            Opcode::VarZ => Some([0.0, 0.0, 1.0, 0.0]),
            Opcode::Const => Some([0.0, 0.0, 0.0, n.value]),
            Opcode::Affine => Some(n.affine),
            _ => None,
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Generic helpers with constant folding

    /// Find or create a node for the given unary operation, with constant
    /// folding
    fn op_unary(&mut self, op: Opcode, a: Id) -> Result<Id, Error> {
        let is_const = self.const_value(a)?.is_some();
        let n = self.insert_op(op, a, None);
        let out = if is_const {
            let v = self.eval_xyz(n, 0.0, 0.0, 0.0)?;
            self.pop(); // removes `n`
            self.constant(v)
        } else {
            n
        };
        Ok(out)
    }

    /// Find or create a node for the given binary operation, with constant
    /// folding
    fn op_binary(&mut self, op: Opcode, a: Id, b: Id) -> Result<Id, Error> {
        let both_const = self.const_value(a)?.is_some()
            && self.const_value(b)?.is_some();
        let n = self.insert_op(op, a, Some(b));
        let out = if both_const {
            let v = self.eval_xyz(n, 0.0, 0.0, 0.0)?;
            self.pop(); // removes `n`
            self.constant(v)
        } else {
            n
        };
        Ok(out)
    }

    /// Find or create a node for the given commutative operation;
    /// deduplication is encouraged by sorting `a` and `b` first
    fn op_binary_commutative(
        &mut self,
        op: Opcode,
        a: Id,
        b: Id,
    ) -> Result<Id, Error> {
        self.op_binary(op, a.min(b), a.max(b))
    }

    ////////////////////////////////////////////////////////////////////////
    // Binary operations

    /// Builds an addition node
    pub fn add<A: IntoId, B: IntoId>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        let b = b.into_id(self)?;
        self.add_inner(a, b, true)
    }

    fn add_inner(&mut self, a: Id, b: Id, promote: bool) -> Result<Id, Error> {
        match (self.const_value(a)?, self.const_value(b)?) {
            (Some(zero), _) if zero == 0.0 => return Ok(b),
            (_, Some(zero)) if zero == 0.0 => return Ok(a),
            _ => (),
        }
        if promote {
            if let (Some(u), Some(v)) = (self.as_affine(a), self.as_affine(b))
            {
                return Ok(self.affine(
                    u[0] + v[0],
                    u[1] + v[1],
                    u[2] + v[2],
                    u[3] + v[3],
                ));
            }
        }
        self.op_binary_commutative(Opcode::Add, a, b)
    }

    /// Builds a subtraction node
    pub fn sub<A: IntoId, B: IntoId>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        let b = b.into_id(self)?;
        self.sub_inner(a, b, true)
    }

    fn sub_inner(&mut self, a: Id, b: Id, promote: bool) -> Result<Id, Error> {
        if a == b {
            return Ok(self.constant(0.0));
        }
        match (self.const_value(a)?, self.const_value(b)?) {
            (_, Some(zero)) if zero == 0.0 => return Ok(a),
            (Some(zero), _) if zero == 0.0 => return self.neg(b),
            _ => (),
        }
        if promote {
            if let (Some(u), Some(v)) = (self.as_affine(a), self.as_affine(b))
            {
                return Ok(self.affine(
                    u[0] - v[0],
                    u[1] - v[1],
                    u[2] - v[2],
                    u[3] - v[3],
                ));
            }
        }
        self.op_binary(Opcode::Sub, a, b)
    }

    /// Builds a multiplication node
    ///
    /// `x * x` is canonicalized to `square(x)`.
    pub fn mul<A: IntoId, B: IntoId>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        let b = b.into_id(self)?;
        self.mul_inner(a, b, true)
    }

    fn mul_inner(&mut self, a: Id, b: Id, promote: bool) -> Result<Id, Error> {
        if a == b {
            return self.square(a);
        }
        let (ca, cb) = (self.const_value(a)?, self.const_value(b)?);
        match (ca, cb) {
            (Some(one), _) if one == 1.0 => return Ok(b),
            (_, Some(one)) if one == 1.0 => return Ok(a),
            (Some(zero), _) if zero == 0.0 => return Ok(a),
            (_, Some(zero)) if zero == 0.0 => return Ok(b),
            _ => (),
        }
        if promote {
            // Only scaling by a constant stays affine
            if let (Some(k), Some(v)) = (ca, self.as_affine(b)) {
                return Ok(self.affine(
                    k * v[0],
                    k * v[1],
                    k * v[2],
                    k * v[3],
                ));
            }
            if let (Some(k), Some(u)) = (cb, self.as_affine(a)) {
                return Ok(self.affine(
                    k * u[0],
                    k * u[1],
                    k * u[2],
                    k * u[3],
                ));
            }
        }
        self.op_binary_commutative(Opcode::Mul, a, b)
    }

    /// Builds a division node
    ///
    /// `x / x` is *not* simplified to 1, since the operand may be zero.
    pub fn div<A: IntoId, B: IntoId>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        let b = b.into_id(self)?;
        match (self.const_value(a)?, self.const_value(b)?) {
            (Some(zero), _) if zero == 0.0 => Ok(a),
            (_, Some(one)) if one == 1.0 => Ok(a),
            _ => self.op_binary(Opcode::Div, a, b),
        }
    }

    /// Builds a `min` node
    pub fn min<A: IntoId, B: IntoId>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        let b = b.into_id(self)?;
        if a == b {
            Ok(a)
        } else {
            self.op_binary_commutative(Opcode::Min, a, b)
        }
    }

    /// Builds a `max` node
    pub fn max<A: IntoId, B: IntoId>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        let b = b.into_id(self)?;
        if a == b {
            Ok(a)
        } else {
            self.op_binary_commutative(Opcode::Max, a, b)
        }
    }

    /// Builds a node computing `atan2(a, b)`
    pub fn atan2<A: IntoId, B: IntoId>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        let b = b.into_id(self)?;
        self.op_binary(Opcode::Atan2, a, b)
    }

    /// Builds a node raising `a` to the power `b`
    ///
    /// The cache accepts any operands, but the evaluator requires the
    /// exponent to be a constant.
    pub fn pow<A: IntoId, B: IntoId>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        let b = b.into_id(self)?;
        self.op_binary(Opcode::Pow, a, b)
    }

    /// Builds a node computing the `b`-th root of `a`
    ///
    /// Evaluated as `a^(1/b)`, so every negative input produces NaN, even
    /// for odd roots.
    pub fn nth_root<A: IntoId, B: IntoId>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        let b = b.into_id(self)?;
        self.op_binary(Opcode::NthRoot, a, b)
    }

    /// Builds a node taking the least non-negative remainder of `a / b`
    pub fn modulo<A: IntoId, B: IntoId>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        let b = b.into_id(self)?;
        self.op_binary(Opcode::Mod, a, b)
    }

    /// Builds a node that returns `b` wherever `a` is NaN, and `a`
    /// elsewhere
    pub fn nanfill<A: IntoId, B: IntoId>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        let b = b.into_id(self)?;
        self.op_binary(Opcode::NanFill, a, b)
    }

    ////////////////////////////////////////////////////////////////////////
    // Unary operations

    /// Builds a unary negation node, simplifying `-(-x)` to `x`
    pub fn neg<A: IntoId>(&mut self, a: A) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        let n = self.node(a)?;
        if n.op == Opcode::Neg {
            return Ok(n.lhs.unwrap());
        }
        self.op_unary(Opcode::Neg, a)
    }

    /// Builds an absolute-value node, simplifying `abs(abs(x))` to
    /// `abs(x)`
    pub fn abs<A: IntoId>(&mut self, a: A) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        if self.node(a)?.op == Opcode::Abs {
            return Ok(a);
        }
        self.op_unary(Opcode::Abs, a)
    }

    /// Builds a node which squares its input
    pub fn square<A: IntoId>(&mut self, a: A) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        self.op_unary(Opcode::Square, a)
    }

    /// Builds a node which takes the square root of its input
    pub fn sqrt<A: IntoId>(&mut self, a: A) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        self.op_unary(Opcode::Sqrt, a)
    }

    /// Builds a node which computes the sine of its input (in radians)
    pub fn sin<A: IntoId>(&mut self, a: A) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        self.op_unary(Opcode::Sin, a)
    }

    /// Builds a node which computes the cosine of its input (in radians)
    pub fn cos<A: IntoId>(&mut self, a: A) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        self.op_unary(Opcode::Cos, a)
    }

    /// Builds a node which computes the tangent of its input (in radians)
    pub fn tan<A: IntoId>(&mut self, a: A) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        self.op_unary(Opcode::Tan, a)
    }

    /// Builds a node which computes the arcsine of its input
    pub fn asin<A: IntoId>(&mut self, a: A) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        self.op_unary(Opcode::Asin, a)
    }

    /// Builds a node which computes the arccosine of its input
    pub fn acos<A: IntoId>(&mut self, a: A) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        self.op_unary(Opcode::Acos, a)
    }

    /// Builds a node which computes the arctangent of its input
    pub fn atan<A: IntoId>(&mut self, a: A) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        self.op_unary(Opcode::Atan, a)
    }

    /// Builds a node which computes the exponential of its input
    pub fn exp<A: IntoId>(&mut self, a: A) -> Result<Id, Error> {
        let a = a.into_id(self)?;
        self.op_unary(Opcode::Exp, a)
    }

    ////////////////////////////////////////////////////////////////////////

    /// Builds an operation node through a dynamic opcode
    ///
    /// Unary opcodes ignore `rhs`; binary opcodes require it.  Nullary and
    /// internal opcodes cannot be built this way and report
    /// [`Error::InvalidOperand`].
    pub fn operation(
        &mut self,
        op: Opcode,
        lhs: Id,
        rhs: Option<Id>,
    ) -> Result<Id, Error> {
        let lhs = lhs.into_id(self)?;
        let rhs = match rhs {
            Some(r) => Some(r.into_id(self)?),
            None => None,
        };
        match op {
            Opcode::Square => self.square(lhs),
            Opcode::Sqrt => self.sqrt(lhs),
            Opcode::Neg => self.neg(lhs),
            Opcode::Abs => self.abs(lhs),
            Opcode::Sin => self.sin(lhs),
            Opcode::Cos => self.cos(lhs),
            Opcode::Tan => self.tan(lhs),
            Opcode::Asin => self.asin(lhs),
            Opcode::Acos => self.acos(lhs),
            Opcode::Atan => self.atan(lhs),
            Opcode::Exp => self.exp(lhs),
            _ => {
                let rhs = rhs.ok_or(Error::InvalidOperand)?;
                match op {
                    Opcode::Add => self.add(lhs, rhs),
                    Opcode::Mul => self.mul(lhs, rhs),
                    Opcode::Min => self.min(lhs, rhs),
                    Opcode::Max => self.max(lhs, rhs),
                    Opcode::Sub => self.sub(lhs, rhs),
                    Opcode::Div => self.div(lhs, rhs),
                    Opcode::Atan2 => self.atan2(lhs, rhs),
                    Opcode::Pow => self.pow(lhs, rhs),
                    Opcode::NthRoot => self.nth_root(lhs, rhs),
                    Opcode::Mod => self.modulo(lhs, rhs),
                    Opcode::NanFill => self.nanfill(lhs, rhs),
                    _ => Err(Error::InvalidOperand),
                }
            }
        }
    }

    /// Rebuilds an operation from remapped operands, without affine
    /// promotion (used by [`Tree::collapse`], which must terminate)
    pub(crate) fn rebuild(
        &mut self,
        op: Opcode,
        lhs: Id,
        rhs: Option<Id>,
    ) -> Result<Id, Error> {
        match op {
            Opcode::Add => self.add_inner(lhs, rhs.unwrap(), false),
            Opcode::Sub => self.sub_inner(lhs, rhs.unwrap(), false),
            Opcode::Mul => self.mul_inner(lhs, rhs.unwrap(), false),
            _ => self.operation(op, lhs, rhs),
        }
    }

    /// Expands affine coefficients into explicit `mul` / `add` structure,
    /// with promotion disabled so the result stays explicit
    pub(crate) fn expand_affine(
        &mut self,
        a: f32,
        b: f32,
        c: f32,
        d: f32,
    ) -> Result<Id, Error> {
        let (x, y, z) = (self.x(), self.y(), self.z());
        let ca = self.constant(a);
        let cb = self.constant(b);
        let cc = self.constant(c);
        let cd = self.constant(d);
        let ax = self.mul_inner(ca, x, false)?;
        let by = self.mul_inner(cb, y, false)?;
        let cz = self.mul_inner(cc, z, false)?;
        let out = self.add_inner(ax, by, false)?;
        let out = self.add_inner(out, cz, false)?;
        self.add_inner(out, cd, false)
    }

    ////////////////////////////////////////////////////////////////////////

    /// Returns the set of ids reachable from `root`, including itself
    pub fn find_connected(&self, root: Id) -> Result<BTreeSet<Id>, Error> {
        self.node(root)?;
        let mut seen = BTreeSet::new();
        let mut todo = vec![root];
        while let Some(id) = todo.pop() {
            if !seen.insert(id) {
                continue;
            }
            let n = self.node(id)?;
            todo.extend(n.lhs);
            todo.extend(n.rhs);
        }
        Ok(seen)
    }

    /// Evaluates the given node at `(x, y, z)` by walking the DAG
    ///
    /// This is extremely inefficient; it exists as a structural reference
    /// for the compiled evaluators, and for constant folding.
    pub fn eval_xyz(
        &self,
        root: Id,
        x: f32,
        y: f32,
        z: f32,
    ) -> Result<f32, Error> {
        let mut memo = vec![None; self.nodes.len()];
        self.eval_inner(root, x, y, z, &mut memo)
    }

    fn eval_inner(
        &self,
        id: Id,
        x: f32,
        y: f32,
        z: f32,
        memo: &mut [Option<f32>],
    ) -> Result<f32, Error> {
        if id.index() >= memo.len() {
            return Err(Error::CacheInvalidated);
        }
        if let Some(v) = memo[id.index()] {
            return Ok(v);
        }
        let n = self.node(id)?;
        let va = match n.lhs {
            Some(a) => self.eval_inner(a, x, y, z, memo)?,
            None => f32::NAN,
        };
        let vb = match n.rhs {
            Some(b) => self.eval_inner(b, x, y, z, memo)?,
            None => f32::NAN,
        };
        let v = match n.op {
            Opcode::Const => n.value,
            Opcode::VarX => x,
            Opcode::VarY => y,
            Opcode::VarZ => z,
            Opcode::Affine => {
                let [a, b, c, d] = n.affine;
                a * x + b * y + c * z + d
            }

            Opcode::Square => va * va,
            Opcode::Sqrt => va.sqrt(),
            Opcode::Neg => -va,
            Opcode::Abs => va.abs(),
            Opcode::Sin => va.sin(),
            Opcode::Cos => va.cos(),
            Opcode::Tan => va.tan(),
            Opcode::Asin => va.asin(),
            Opcode::Acos => va.acos(),
            Opcode::Atan => va.atan(),
            Opcode::Exp => va.exp(),

            Opcode::Add => va + vb,
            Opcode::Mul => va * vb,
            Opcode::Min => va.min(vb),
            Opcode::Max => va.max(vb),
            Opcode::Sub => va - vb,
            Opcode::Div => va / vb,
            Opcode::Atan2 => va.atan2(vb),
            Opcode::Pow => va.powf(vb),
            Opcode::NthRoot => va.powf(1.0 / vb),
            Opcode::Mod => va.rem_euclid(vb),
            Opcode::NanFill => {
                if va.is_nan() {
                    vb
                } else {
                    va
                }
            }

            op => unreachable!("{op} node stored in cache"),
        };
        memo[id.index()] = Some(v);
        Ok(v)
    }

    /// Parses a flat text representation of a math tree. For example, the
    /// circle `(- (sqrt (+ (square x) (square y))) 1)` can be parsed from
    /// ```
    /// # use isofield::Cache;
    /// let txt = "
    /// ## This is a comment!
    /// 0x600000b90000 var-x
    /// 0x600000b900a0 square 0x600000b90000
    /// 0x600000b90050 var-y
    /// 0x600000b900f0 square 0x600000b90050
    /// 0x600000b90140 add 0x600000b900a0 0x600000b900f0
    /// 0x600000b90190 sqrt 0x600000b90140
    /// 0x600000b901e0 const 1
    /// 0x600000b90230 sub 0x600000b90190 0x600000b901e0
    /// ";
    /// let (cache, root) = Cache::from_text(txt.as_bytes()).unwrap();
    /// assert_eq!(cache.eval_xyz(root, 1.0, 0.0, 0.0).unwrap(), 0.0);
    /// ```
    ///
    /// This representation is loosely defined and only intended for use in
    /// quick experiments.
    pub fn from_text<R: Read>(r: R) -> Result<(Self, Id), Error> {
        let reader = BufReader::new(r);
        let mut cache = Self::new();
        let mut seen: BTreeMap<String, Id> = BTreeMap::new();
        let mut last = None;

        for line in reader.lines().map(|line| line.unwrap()) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut iter = line.split_whitespace();
            let i: String = iter.next().unwrap().to_owned();
            let name = iter.next().unwrap();

            let mut pop = || {
                let txt = iter.next().unwrap();
                seen.get(txt)
                    .cloned()
                    .ok_or_else(|| Error::UnknownVariable(txt.to_string()))
            };
            let node = match name {
                "const" => {
                    cache.constant(iter.next().unwrap().parse().unwrap())
                }
                "var-x" => cache.x(),
                "var-y" => cache.y(),
                "var-z" => cache.z(),
                _ => {
                    let op = Opcode::from_str(name).map_err(|_| {
                        Error::UnknownOpcode(name.to_owned())
                    })?;
                    match op.arity() {
                        1 => {
                            let a = pop()?;
                            cache.operation(op, a, None)?
                        }
                        2 => {
                            let a = pop()?;
                            let b = pop()?;
                            cache.operation(op, a, Some(b))?
                        }
                        _ => {
                            return Err(Error::UnknownOpcode(
                                name.to_owned(),
                            ))
                        }
                    }
                }
            };
            seen.insert(i, node);
            last = Some(node);
        }
        match last {
            Some(node) => Ok((cache, node)),
            None => Err(Error::EmptyFile),
        }
    }
}

////////////////////////////////////////////////////////////////////////////
/// Helper trait for things that can be converted into an [`Id`] given a
/// [`Cache`]
///
/// This trait allows you to write
/// ```
/// # let mut cache = isofield::Cache::new();
/// let x = cache.x();
/// let sum = cache.add(x, 1.0).unwrap();
/// ```
/// instead of the more verbose
/// ```
/// # let mut cache = isofield::Cache::new();
/// let x = cache.x();
/// let num = cache.constant(1.0);
/// let sum = cache.add(x, num).unwrap();
/// ```
pub trait IntoId {
    /// Converts the given value into a node id
    fn into_id(self, cache: &mut Cache) -> Result<Id, Error>;
}

impl IntoId for Id {
    fn into_id(self, cache: &mut Cache) -> Result<Id, Error> {
        cache.node(self)?;
        Ok(self)
    }
}

impl IntoId for f32 {
    fn into_id(self, cache: &mut Cache) -> Result<Id, Error> {
        Ok(cache.constant(self))
    }
}

////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_dedup() {
        let mut cache = Cache::new();
        let x1 = cache.x();
        let x2 = cache.x();
        assert_eq!(x1, x2);

        let a = cache.constant(1.5);
        let b = cache.constant(1.5);
        assert_eq!(a, b);

        let y = cache.y();
        let s1 = cache.min(x1, y).unwrap();
        let s2 = cache.min(x1, y).unwrap();
        assert_eq!(s1, s2);
    }

    #[test]
    fn test_commutative_normalization() {
        let mut cache = Cache::new();
        let x = cache.x();
        let y = cache.y();
        for op in [Opcode::Add, Opcode::Mul, Opcode::Min, Opcode::Max] {
            let ab = cache.operation(op, x, Some(y)).unwrap();
            let ba = cache.operation(op, y, Some(x)).unwrap();
            assert_eq!(ab, ba, "{op} did not normalize");
        }
        let d1 = cache.sub(x, y).unwrap();
        let d2 = cache.sub(y, x).unwrap();
        assert_ne!(d1, d2);
    }

    #[test]
    fn test_constant_coalescing() {
        let mut cache = Cache::new();
        // Bitwise keys: ±0 stay distinct, all NaNs merge
        assert_ne!(cache.constant(0.0), cache.constant(-0.0));
        assert_eq!(cache.constant(f32::NAN), cache.constant(-f32::NAN));
        assert_eq!(cache.constant(2.0), cache.constant(2.0));
    }

    #[test]
    fn test_identities() {
        let mut cache = Cache::new();
        let x = cache.x();
        let y = cache.y();
        let zero = cache.constant(0.0);
        let one = cache.constant(1.0);
        let s = cache.sin(y).unwrap(); // opaque non-affine operand

        assert_eq!(cache.add(s, zero).unwrap(), s);
        assert_eq!(cache.add(zero, s).unwrap(), s);
        assert_eq!(cache.mul(s, one).unwrap(), s);
        assert_eq!(cache.mul(one, s).unwrap(), s);
        assert_eq!(cache.mul(s, zero).unwrap(), zero);
        assert_eq!(cache.mul(zero, s).unwrap(), zero);
        assert_eq!(cache.sub(s, zero).unwrap(), s);
        assert_eq!(cache.div(s, one).unwrap(), s);
        assert_eq!(cache.div(zero, s).unwrap(), zero);
        assert_eq!(cache.min(s, s).unwrap(), s);
        assert_eq!(cache.max(s, s).unwrap(), s);

        let d = cache.sub(s, s).unwrap();
        assert_eq!(cache.const_value(d).unwrap(), Some(0.0));

        let n = cache.neg(s).unwrap();
        assert_eq!(cache.neg(n).unwrap(), s);

        let a = cache.abs(s).unwrap();
        assert_eq!(cache.abs(a).unwrap(), a);

        let q = cache.mul(s, s).unwrap();
        assert_eq!(cache.opcode(q), Some(Opcode::Square));
        assert_eq!(cache.square(s).unwrap(), q);

        // x / x is deliberately left alone
        let r = cache.div(x, x).unwrap();
        assert_eq!(cache.opcode(r), Some(Opcode::Div));
    }

    #[test]
    fn test_constant_folding() {
        let mut cache = Cache::new();
        let a = cache.constant(2.0);
        let b = cache.constant(3.0);
        let before = cache.len();

        let s = cache.min(a, b).unwrap();
        assert_eq!(cache.const_value(s).unwrap(), Some(2.0));
        let p = cache.pow(a, b).unwrap();
        assert_eq!(cache.const_value(p).unwrap(), Some(8.0));
        let n = cache.neg(b).unwrap();
        assert_eq!(cache.const_value(n).unwrap(), Some(-3.0));

        // Folding must not leave temporary operation nodes behind
        assert_eq!(cache.len(), before + 2); // just the constants 8 and -3
    }

    #[test]
    fn test_affine_promotion() {
        let mut cache = Cache::new();
        let x = cache.x();
        let y = cache.y();

        let s = cache.add(x, y).unwrap();
        assert_eq!(
            cache.get_affine(s).unwrap(),
            Some([1.0, 1.0, 0.0, 0.0])
        );

        let t = cache.add(x, 1.0).unwrap();
        assert_eq!(
            cache.get_affine(t).unwrap(),
            Some([1.0, 0.0, 0.0, 1.0])
        );

        let u = cache.mul(2.0, x).unwrap();
        assert_eq!(
            cache.get_affine(u).unwrap(),
            Some([2.0, 0.0, 0.0, 0.0])
        );

        let v = cache.sub(u, x).unwrap();
        assert_eq!(
            cache.get_affine(v).unwrap(),
            Some([1.0, 0.0, 0.0, 0.0])
        );

        // 2x - 2x collapses all the way down to a constant
        let w = cache.sub(u, u).unwrap();
        assert_eq!(cache.const_value(w).unwrap(), Some(0.0));

        // x + x promotes rather than building an `add` node
        let d = cache.add(x, x).unwrap();
        assert_eq!(
            cache.get_affine(d).unwrap(),
            Some([2.0, 0.0, 0.0, 0.0])
        );

        // Non-affine operands stay put
        let q = cache.sin(x).unwrap();
        let r = cache.add(q, 1.0).unwrap();
        assert_eq!(cache.opcode(r), Some(Opcode::Add));
    }

    #[test]
    fn test_affine_round_trip() {
        let mut cache = Cache::new();
        let a = cache.affine(2.0, 0.0, 0.0, 1.0);
        assert_eq!(
            cache.get_affine(a).unwrap(),
            Some([2.0, 0.0, 0.0, 1.0])
        );
        assert_eq!(cache.eval_xyz(a, 3.0, 99.0, 99.0).unwrap(), 7.0);

        // Degenerate affine forms are plain constants
        let c = cache.affine(0.0, 0.0, 0.0, 5.0);
        assert_eq!(cache.const_value(c).unwrap(), Some(5.0));
    }

    #[test]
    fn test_rank() {
        let mut cache = Cache::new();
        let x = cache.x();
        let s = cache.sin(x).unwrap();
        let q = cache.square(s).unwrap();
        let sum = cache.add(q, s).unwrap();
        assert_eq!(cache.node(x).unwrap().rank, 0);
        assert_eq!(cache.node(s).unwrap().rank, 1);
        assert_eq!(cache.node(q).unwrap().rank, 2);
        assert_eq!(cache.node(sum).unwrap().rank, 3);
    }

    #[test]
    fn test_key_order() {
        let mut cache = Cache::new();
        let x = cache.x();
        let s = cache.sin(x).unwrap();
        let _ = cache.add(s, 3.0).unwrap();
        let _ = cache.constant(7.0);

        // Constants first, then everything in ascending rank
        let ops: Vec<_> =
            cache.iter_keys().map(|(k, _)| (k.op, k.rank)).collect();
        let n_const =
            ops.iter().take_while(|(op, _)| *op == Opcode::Const).count();
        assert!(ops[..n_const].iter().all(|(op, _)| *op == Opcode::Const));
        assert!(ops[n_const..].iter().all(|(op, _)| *op != Opcode::Const));
        let ranks: Vec<_> = ops.iter().map(|(_, r)| *r).collect();
        assert!(ranks.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_find_connected() {
        let mut cache = Cache::new();
        let x = cache.x();
        let y = cache.y();
        let s = cache.min(x, y).unwrap();
        let _unrelated = cache.sin(y).unwrap();

        let c = cache.find_connected(s).unwrap();
        assert_eq!(c.len(), 3);
        assert!(c.contains(&x) && c.contains(&y) && c.contains(&s));
    }

    #[test]
    fn test_reset() {
        let mut cache = Cache::new();
        let x = cache.x();
        let s = cache.sin(x).unwrap();
        assert_eq!(cache.len(), 2);

        cache.reset();
        assert!(cache.is_empty());
        assert_eq!(cache.eval_xyz(s, 0.0, 0.0, 0.0), Err(Error::CacheInvalidated));
        assert_eq!(cache.const_value(s), Err(Error::CacheInvalidated));
    }

    #[test]
    fn test_operation_rejects_internal_opcodes() {
        let mut cache = Cache::new();
        let x = cache.x();
        for op in [
            Opcode::Const,
            Opcode::VarX,
            Opcode::Affine,
            Opcode::DummyA,
            Opcode::DummyB,
            Opcode::Invalid,
        ] {
            assert_eq!(
                cache.operation(op, x, Some(x)),
                Err(Error::InvalidOperand),
                "{op} should not be constructible"
            );
        }
        // Binary opcodes require a second operand
        assert_eq!(
            cache.operation(Opcode::Add, x, None),
            Err(Error::InvalidOperand)
        );
    }

    #[test]
    fn test_eval_xyz() {
        let mut cache = Cache::new();
        let x = cache.x();
        let y = cache.y();
        let z = cache.z();
        let p = cache.mul(x, y).unwrap();
        let p = cache.div(p, z).unwrap();
        assert_eq!(cache.eval_xyz(p, 3.0, 5.0, 2.0).unwrap(), 7.5);

        let m = cache.modulo(x, 3.0).unwrap();
        assert_eq!(cache.eval_xyz(m, -1.0, 0.0, 0.0).unwrap(), 2.0);

        let f = cache.sqrt(x).unwrap();
        let f = cache.nanfill(f, 9.0).unwrap();
        assert_eq!(cache.eval_xyz(f, -4.0, 0.0, 0.0).unwrap(), 9.0);
        assert_eq!(cache.eval_xyz(f, 4.0, 0.0, 0.0).unwrap(), 2.0);
    }

    #[test]
    fn test_from_text() {
        let txt = "
# circle of radius 1
1 var-x
2 square 1
3 var-y
4 square 3
5 add 2 4
6 sqrt 5
7 const 1
8 sub 6 7
";
        let (cache, root) = Cache::from_text(txt.as_bytes()).unwrap();
        assert_eq!(cache.eval_xyz(root, 0.0, 0.0, 0.0).unwrap(), -1.0);
        assert_eq!(cache.eval_xyz(root, 1.0, 0.0, 0.0).unwrap(), 0.0);

        let r = Cache::from_text("1 banana".as_bytes());
        assert_eq!(r.unwrap_err(), Error::UnknownOpcode("banana".to_owned()));
        let r = Cache::from_text("".as_bytes());
        assert_eq!(r.unwrap_err(), Error::EmptyFile);
    }
}
