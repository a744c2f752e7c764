//! Value boxing
//!
//! Maps boxed values to compact 64-bit codes, one table per *unified
//! position* - the equivalence class of identifier sites that must share a
//! type. Primitives use reversible bit-level encodings; structured values
//! get incrementing object ids behind a per-position reader-writer lock, so
//! fact vectors can be encoded from parallel shards.
//!
//! A position's type is set on first use; mixing types at one position is a
//! bug and aborts.

use crate::index::Tuple;
use datalog_ast::Boxed;
use parking_lot::RwLock;
use rayon::prelude::*;
use std::collections::HashMap;

/// The value kind pinned to a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeTag {
    Unknown,
    Bool,
    Char,
    Int32,
    Int64,
    Float64,
    Obj,
}

fn tag_of(v: &Boxed) -> TypeTag {
    match v {
        Boxed::Bool(_) => TypeTag::Bool,
        Boxed::Char(_) => TypeTag::Char,
        Boxed::Int32(_) => TypeTag::Int32,
        Boxed::Int64(_) => TypeTag::Int64,
        Boxed::Float64(_) => TypeTag::Float64,
        Boxed::Str(_) | Boxed::Vector(_) | Boxed::Tag(_, _) => TypeTag::Obj,
        Boxed::NoValue => panic!("bug: NoValue reached the boxing registry"),
    }
}

#[derive(Debug, Default)]
struct Position {
    ty: TypeTag,
    /// Object id assignment; readers of settled codes only contend with
    /// writers appending fresh ids.
    forward: HashMap<Boxed, i64>,
    backward: Vec<Boxed>,
}

impl Default for TypeTag {
    fn default() -> Self {
        TypeTag::Unknown
    }
}

/// Per-position boxing tables. Grown at inject time, then frozen for the
/// execution.
#[derive(Debug)]
pub struct ValueStore {
    positions: Vec<RwLock<Position>>,
}

impl ValueStore {
    pub fn new(position_count: usize) -> Self {
        ValueStore {
            positions: (0..position_count)
                .map(|_| RwLock::new(Position::default()))
                .collect(),
        }
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    /// Encode a value at a unified position.
    pub fn unbox_with(&self, v: &Boxed, pos: usize) -> i64 {
        let tag = tag_of(v);
        {
            let slot = self.positions[pos].read();
            match slot.ty {
                TypeTag::Unknown => {}
                ty if ty == tag => {
                    // Primitive encodings never need the table.
                    if tag != TypeTag::Obj {
                        return encode_primitive(v);
                    }
                    if let Some(&code) = slot.forward.get(v) {
                        return code;
                    }
                }
                ty => panic!(
                    "bug: position {} holds {:?} values, got {}",
                    pos,
                    ty,
                    v.kind()
                ),
            }
        }
        let mut slot = self.positions[pos].write();
        if slot.ty == TypeTag::Unknown {
            slot.ty = tag;
        } else if slot.ty != tag {
            panic!(
                "bug: position {} holds {:?} values, got {}",
                pos,
                slot.ty,
                v.kind()
            );
        }
        if tag != TypeTag::Obj {
            return encode_primitive(v);
        }
        if let Some(&code) = slot.forward.get(v) {
            return code;
        }
        let code = slot.backward.len() as i64;
        slot.backward.push(v.clone());
        slot.forward.insert(v.clone(), code);
        code
    }

    /// Decode a code at a unified position. The position's type must have
    /// been set by a prior `unbox_with`.
    pub fn box_with(&self, code: i64, pos: usize) -> Boxed {
        let slot = self.positions[pos].read();
        match slot.ty {
            TypeTag::Unknown => panic!("bug: boxing through untyped position {}", pos),
            TypeTag::Bool => Boxed::Bool(code != 0),
            TypeTag::Char => {
                let c = u32::try_from(code)
                    .ok()
                    .and_then(char::from_u32)
                    .unwrap_or_else(|| panic!("bug: invalid char code {} at {}", code, pos));
                Boxed::Char(c)
            }
            TypeTag::Int32 => Boxed::Int32(code as i32),
            TypeTag::Int64 => Boxed::Int64(code),
            TypeTag::Float64 => Boxed::Float64(f64::from_bits(code as u64)),
            TypeTag::Obj => slot
                .backward
                .get(code as usize)
                .cloned()
                .unwrap_or_else(|| panic!("bug: unknown object code {} at {}", code, pos)),
        }
    }

    /// Encode fact rows in parallel shards. `positions[i]` is the unified
    /// position of column `i`.
    pub fn unbox_rows(&self, rows: &[Vec<Boxed>], positions: &[usize]) -> Vec<Tuple> {
        rows.par_iter()
            .map(|row| {
                row.iter()
                    .zip(positions)
                    .map(|(v, &pos)| self.unbox_with(v, pos))
                    .collect()
            })
            .collect()
    }
}

fn encode_primitive(v: &Boxed) -> i64 {
    match v {
        Boxed::Bool(b) => i64::from(*b),
        Boxed::Char(c) => i64::from(u32::from(*c)),
        // Sign-preserving widening.
        Boxed::Int32(i) => i64::from(*i),
        Boxed::Int64(i) => *i,
        // Bitcast keeps the encoding reversible; ordering of codes is not
        // meaningful for floats and positions never rely on it.
        Boxed::Float64(f) => f.to_bits() as i64,
        other => panic!("bug: {} is not a primitive", other.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_round_trip() {
        let store = ValueStore::new(4);
        for (pos, v) in [
            (0, Boxed::Bool(true)),
            (1, Boxed::Int32(-7)),
            (2, Boxed::Int64(i64::MIN + 1)),
            (3, Boxed::Float64(-0.5)),
        ] {
            let code = store.unbox_with(&v, pos);
            assert_eq!(store.box_with(code, pos), v);
        }
    }

    #[test]
    fn test_object_ids_increment_per_position() {
        let store = ValueStore::new(2);
        let a = store.unbox_with(&Boxed::str("a"), 0);
        let b = store.unbox_with(&Boxed::str("b"), 0);
        let a_again = store.unbox_with(&Boxed::str("a"), 0);
        assert_eq!((a, b), (0, 1));
        assert_eq!(a, a_again);
        // A different position has its own id space.
        assert_eq!(store.unbox_with(&Boxed::str("b"), 1), 0);
    }

    #[test]
    #[should_panic(expected = "bug: position 0 holds")]
    fn test_mixed_types_at_one_position_is_a_bug() {
        let store = ValueStore::new(1);
        store.unbox_with(&Boxed::Int64(1), 0);
        store.unbox_with(&Boxed::Bool(true), 0);
    }

    #[test]
    #[should_panic(expected = "untyped position")]
    fn test_boxing_before_type_is_set_is_a_bug() {
        let store = ValueStore::new(1);
        store.box_with(0, 0);
    }

    #[test]
    fn test_parallel_shard_initialization() {
        let store = ValueStore::new(2);
        let rows: Vec<Vec<Boxed>> = (0..200)
            .map(|i| vec![Boxed::Int64(i), Boxed::str(format!("s{}", i % 10))])
            .collect();
        let tuples = store.unbox_rows(&rows, &[0, 1]);
        assert_eq!(tuples.len(), 200);
        // Ten distinct strings got ten distinct codes.
        let distinct: std::collections::HashSet<i64> = tuples.iter().map(|t| t[1]).collect();
        assert_eq!(distinct.len(), 10);
        // Every code decodes back to its string.
        for (row, tuple) in rows.iter().zip(&tuples) {
            assert_eq!(store.box_with(tuple[1], 1), row[1]);
        }
    }

    #[test]
    fn test_tagged_values_box_as_objects() {
        let store = ValueStore::new(1);
        let v = Boxed::tag("Down", vec![Boxed::Int32(3)]);
        let code = store.unbox_with(&v, 0);
        assert_eq!(store.box_with(code, 0), v);
    }
}
