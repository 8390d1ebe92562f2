//! Validation and normalization of 9P walk paths.
//!
//! Walk requests carry a list of path elements. A *normalized* list has no
//! empty or `.` elements, no `/` or `\` characters, and `..` only as a
//! prefix. An *internal path* is an absolute, slash-joined path built from
//! normalized elements; it always begins with `/` and never contains `.`,
//! `..` or empty elements.

use crate::error::{ename, Error};
use crate::utils::Result;

fn bad_element(s: &str) -> bool {
    s.contains('/') || s.contains('\\')
}

/// Check that `names` is a normalized relative path.
///
/// Returns `None` if any element is empty or `.`, contains `/` or `\`,
/// or if `..` follows a non-`..` element. Otherwise returns the number
/// of leading `..` elements.
pub fn valid_path<S: AsRef<str>>(names: &[S]) -> Option<usize> {
    let mut n = 0;
    for (i, s) in names.iter().enumerate() {
        let s = s.as_ref();
        if s.is_empty() || s == "." {
            return None;
        } else if s == ".." {
            if n != i {
                return None;
            }
            n += 1;
        } else if bad_element(s) {
            return None;
        }
    }
    Some(n)
}

/// Normalize a path by removing all empty and `.` elements, and treating
/// every `..` as a backspace. The result may only contain `..` elements
/// at the beginning of the path.
///
/// Returns the cleaned elements plus the number of surviving leading `..`;
/// `None` if any element contains `/` or `\`.
///
/// Note: `std::path` cleanup does not keep `..` at the root, which walk
/// targets need.
pub fn normalize_path<S: AsRef<str>>(names: &[S]) -> Option<(Vec<String>, usize)> {
    let mut ans: Vec<String> = Vec::with_capacity(names.len());

    let mut lo = 0; // highest non-".." entry
    for s in names {
        let s = s.as_ref();
        if bad_element(s) {
            return None;
        }
        if s.is_empty() || s == "." {
            // skip
            continue;
        }
        if s == ".." {
            // pop
            if ans.len() > lo {
                ans.pop();
                continue;
            }
            // can't pop, fall-through
            lo += 1;
        }
        ans.push(s.to_owned());
    }
    Some((ans, lo))
}

/// Split a user-supplied POSIX-style path into (absolute?, walk steps).
///
/// Absolute paths must not normalize to anything with a leading `..`.
pub fn to_walk(p: &str) -> Result<(bool, Vec<String>)> {
    let is_abs = p.starts_with('/');
    let elems: Vec<&str> = p.trim_matches('/').split('/').collect();
    let (steps, bsp) = normalize_path(&elems)
        .ok_or_else(|| Error::Proto(format!("invalid path: {}", p)))?;

    if is_abs && bsp != 0 {
        return Err(Error::Proto(format!("invalid path: {}", p)));
    }

    Ok((is_abs, steps))
}

/// Find the internal path reached by walking `names` from `dir`.
///
/// `dir` must be a valid internal path and `names` a normalized relative
/// path whose leading `..` count does not exceed `dir`'s depth; a walk
/// that would climb above the root is rejected.
pub fn walk_name(dir: &str, names: &[String]) -> Result<String> {
    let bsp = valid_path(names).ok_or_else(|| Error::proto(ename::INVALID_PATH))?;

    let mut parts: Vec<&str> = dir.split('/').filter(|s| !s.is_empty()).collect();
    if bsp > parts.len() {
        return Err(Error::proto(ename::INVALID_PATH));
    }
    for name in names {
        if name == ".." {
            parts.pop();
        } else {
            parts.push(name);
        }
    }

    Ok(format!("/{}", parts.join("/")))
}

/// Find the internal path of `Create(name)` under the directory `dir`.
///
/// `name` must be a single element: not empty, not `.` or `..`, and
/// free of slashes.
pub fn create_name(dir: &str, name: &str) -> Result<String> {
    if name.is_empty() || name == "." || name == ".." || bad_element(name) {
        return Err(Error::proto(ename::ILLEGAL_NAME));
    }
    if dir == "/" {
        Ok(format!("/{}", name))
    } else {
        Ok(format!("{}/{}", dir, name))
    }
}

/// Check the internal-path invariants: absolute, no backslashes, and no
/// empty, `.` or `..` elements. Servers exposing a real filesystem must
/// hold every path they hand to the OS to this shape so that a walk can
/// never escape their root.
pub fn is_internal(p: &str) -> bool {
    if !p.starts_with('/') || p.contains('\\') {
        return false;
    }
    if p == "/" {
        return true;
    }
    p[1..].split('/').all(|s| !s.is_empty() && s != "." && s != "..")
}
