//! Tree path expressions: `["key"][0]['other']`.
//!
//! A segment is either a quoted mapping key (single or double quotes, no
//! escapes) or an unsigned sequence index.

use crate::error::{Result, SopsError};
use crate::tree::{TreeBranch, Value, METADATA_KEY};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(key) => write!(f, "[{key:?}]"),
            PathSegment::Index(index) => write!(f, "[{index}]"),
        }
    }
}

pub fn format_path(path: &[PathSegment]) -> String {
    path.iter().map(ToString::to_string).collect()
}

/// Parse a path expression. The empty expression selects the whole branch.
pub fn parse_path(expr: &str) -> Result<Vec<PathSegment>> {
    let invalid = |reason: &str| SopsError::InvalidPath(format!("{expr}: {reason}"));

    let mut segments = Vec::new();
    let mut rest = expr.trim();
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[').ok_or_else(|| invalid("expected '['"))?;
        match inner.chars().next() {
            Some(quote @ ('"' | '\'')) => {
                let body = &inner[1..];
                let end = body.find(quote).ok_or_else(|| invalid("unterminated key"))?;
                rest = body[end + 1..]
                    .strip_prefix(']')
                    .ok_or_else(|| invalid("expected ']' after key"))?;
                segments.push(PathSegment::Key(body[..end].to_string()));
            }
            _ => {
                let end = inner.find(']').ok_or_else(|| invalid("expected ']'"))?;
                let index = inner[..end]
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| {
                        invalid(&format!("{:?} is not a key or an index", &inner[..end]))
                    })?;
                rest = &inner[end + 1..];
                segments.push(PathSegment::Index(index));
            }
        }
    }
    Ok(segments)
}

/// Return a copy of the value at `path`.
pub fn truncate(branch: &TreeBranch, path: &[PathSegment]) -> Result<Value> {
    let mut current = match path.first() {
        None => return Ok(Value::Branch(branch.clone())),
        Some(PathSegment::Key(key)) => branch
            .get(key)
            .ok_or_else(|| SopsError::PathNotFound(format_path(&path[..1])))?,
        Some(PathSegment::Index(_)) => {
            return Err(SopsError::InvalidPath(format!(
                "{}: a document root can only be indexed by key",
                format_path(path)
            )))
        }
    };

    for (depth, segment) in path.iter().enumerate().skip(1) {
        let found = match (segment, current) {
            (PathSegment::Key(key), Value::Branch(b)) => b.get(key),
            (PathSegment::Index(i), Value::Array(items)) => items.get(*i),
            _ => None,
        };
        current = found.ok_or_else(|| SopsError::PathNotFound(format_path(&path[..=depth])))?;
    }
    Ok(current.clone())
}

/// Store `value` at `path`, creating intermediate branches and sequences.
///
/// A node of the wrong kind on the way is replaced by a container of the
/// kind the next segment needs. An index past the end of a sequence appends.
/// The top-level metadata key cannot be written.
pub fn set(branch: &mut TreeBranch, path: &[PathSegment], value: Value) -> Result<()> {
    match path.split_first() {
        None => Err(SopsError::InvalidPath("cannot set an empty path".into())),
        Some((PathSegment::Key(key), _)) if key == METADATA_KEY => {
            Err(SopsError::ReservedKey(METADATA_KEY.to_string()))
        }
        Some((PathSegment::Key(key), rest)) => {
            set_in_branch(branch, key, rest, value);
            Ok(())
        }
        Some((PathSegment::Index(_), _)) => Err(SopsError::InvalidPath(format!(
            "{}: a document root can only be indexed by key",
            format_path(path)
        ))),
    }
}

fn set_in_branch(branch: &mut TreeBranch, key: &str, rest: &[PathSegment], value: Value) {
    match branch.get_mut(key) {
        Some(slot) => set_in_value(slot, rest, value),
        None => {
            let mut slot = Value::Null;
            set_in_value(&mut slot, rest, value);
            branch.insert(key, slot);
        }
    }
}

fn set_in_array(items: &mut Vec<Value>, index: usize, rest: &[PathSegment], value: Value) {
    match items.get_mut(index) {
        Some(slot) => set_in_value(slot, rest, value),
        None => {
            let mut slot = Value::Null;
            set_in_value(&mut slot, rest, value);
            items.push(slot);
        }
    }
}

fn set_in_value(current: &mut Value, path: &[PathSegment], value: Value) {
    match path.split_first() {
        None => *current = value,
        Some((PathSegment::Key(key), rest)) => {
            if let Value::Branch(branch) = current {
                set_in_branch(branch, key, rest, value);
            } else {
                let mut branch = TreeBranch::new();
                set_in_branch(&mut branch, key, rest, value);
                *current = Value::Branch(branch);
            }
        }
        Some((PathSegment::Index(index), rest)) => {
            if let Value::Array(items) = current {
                set_in_array(items, *index, rest, value);
            } else {
                let mut items = Vec::new();
                set_in_array(&mut items, *index, rest, value);
                *current = Value::Array(items);
            }
        }
    }
}

/// Remove the key or sequence element at `path` and return it.
pub fn unset(branch: &mut TreeBranch, path: &[PathSegment]) -> Result<Value> {
    let not_found = || SopsError::PathNotFound(format_path(path));
    let Some((last, parents)) = path.split_last() else {
        return Err(SopsError::InvalidPath("cannot unset an empty path".into()));
    };

    let Some((first, middle)) = parents.split_first() else {
        return match last {
            PathSegment::Key(key) => branch.remove(key).ok_or_else(not_found),
            PathSegment::Index(_) => Err(SopsError::InvalidPath(format!(
                "{}: a document root can only be indexed by key",
                format_path(path)
            ))),
        };
    };

    let PathSegment::Key(first) = first else {
        return Err(not_found());
    };
    let mut parent = branch.get_mut(first).ok_or_else(not_found)?;
    for segment in middle {
        parent = match (segment, parent) {
            (PathSegment::Key(key), Value::Branch(b)) => b.get_mut(key),
            (PathSegment::Index(i), Value::Array(items)) => items.get_mut(*i),
            _ => None,
        }
        .ok_or_else(not_found)?;
    }

    match (last, parent) {
        (PathSegment::Key(key), Value::Branch(b)) => b.remove(key).ok_or_else(not_found),
        (PathSegment::Index(i), Value::Array(items)) if *i < items.len() => Ok(items.remove(*i)),
        _ => Err(not_found()),
    }
}
