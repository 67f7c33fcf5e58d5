//! Parameter shape descriptors and the argument adapter.
//!
//! A callable declares, in order: `left_req` required parameters, some
//! optional parameters, at most one rest collector, then required parameters
//! positioned after the rest collector. [`Arity`] stores the externally
//! visible bounds (`min`, `max`, with `max == -1` meaning unbounded) together
//! with the number of physical slots (`real`) the body expects.
//!
//! [`fix_args`] reshapes a raw argument list into exactly `real` slots in a
//! single pass:
//!
//! | slot                           | value                                         |
//! |--------------------------------|-----------------------------------------------|
//! | `i < left_req`                 | `raw[i]`                                      |
//! | optional, rank < `argc - min`  | `raw[i]`                                      |
//! | optional, otherwise            | [`Value::Undef`]                              |
//! | rest                           | array of the `argc - real + 1` unclaimed args |
//! | post-required                  | `raw[argc - (real - i)]`                      |
use crate::{
    error::DispatchError,
    fatal,
    value::{ArgBuffer, Value},
};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Arity {
    pub min: i32,
    pub max: i32,
    pub real: usize,
    pub left_req: usize,
}

impl Arity {
    pub fn new(min: i32, max: i32, real: usize, left_req: usize) -> Self {
        assert!(min >= 0 && (max == -1 || max >= min), "invalid arity bounds {min}..{max}");
        assert!(left_req <= real, "left_req {left_req} exceeds real {real}");
        assert!(min as usize <= real, "min {min} exceeds real {real}");
        if max == -1 {
            assert!(real > min as usize, "unbounded arity needs a rest slot");
        } else {
            assert!(real == max as usize, "bounded arity must have real == max");
        }
        Self {
            min,
            max,
            real,
            left_req,
        }
    }

    /// Exactly `n` required parameters.
    pub fn fixed(n: usize) -> Self {
        Self::new(n as i32, n as i32, n, n)
    }

    /// Builds the descriptor from a parameter list shape.
    pub fn from_params(required: usize, optional: usize, rest: bool, post: usize) -> Self {
        let min = (required + post) as i32;
        let real = required + optional + usize::from(rest) + post;
        let max = if rest { -1 } else { real as i32 };
        Self::new(min, max, real, required)
    }

    /// Any number of arguments collected into one rest slot.
    pub fn variadic() -> Self {
        Self::from_params(0, 0, true, 0)
    }

    pub fn has_rest(&self) -> bool {
        self.max == -1
    }

    pub fn optional(&self) -> usize {
        let fixed = self.real - self.min as usize;
        if self.has_rest() {
            fixed - 1
        } else {
            fixed
        }
    }

    pub fn post_required(&self) -> usize {
        self.min as usize - self.left_req
    }

    pub fn rest_index(&self) -> Option<usize> {
        self.has_rest().then(|| self.left_req + self.optional())
    }

    pub fn accepts(&self, argc: usize) -> bool {
        argc >= self.min as usize && (self.max == -1 || argc <= self.max as usize)
    }

    pub fn check(&self, argc: usize) -> Result<(), DispatchError> {
        if self.accepts(argc) {
            Ok(())
        } else {
            Err(DispatchError::arity(argc, self.min, self.max))
        }
    }

    /// Whether raw arguments must go through [`fix_args`] before the body
    /// can consume them.
    pub fn needs_fixing(&self, argc: usize) -> bool {
        argc != self.real || self.has_rest()
    }
}

/// Reshapes `raw` to the `real` slots `arity` describes.
///
/// Callers check bounds first ([`Arity::check`]); an out-of-range count here
/// means the calling convention was violated and aborts the process.
pub fn fix_args(raw: &[Value], arity: &Arity) -> ArgBuffer {
    let argc = raw.len();
    if !arity.accepts(argc) {
        fatal!(
            "argument adapter called with {argc} arguments for arity {}..{}",
            arity.min,
            arity.max
        );
    }

    let supplied_optionals = argc - arity.min as usize;
    let optionals = arity.optional();
    let rest = arity.rest_index();

    let mut fixed = ArgBuffer::with_capacity(arity.real);
    for i in 0..arity.real {
        let v = if i < arity.left_req {
            raw[i].clone()
        } else if i < arity.left_req + optionals {
            if i - arity.left_req < supplied_optionals {
                raw[i].clone()
            } else {
                Value::Undef
            }
        } else if Some(i) == rest {
            let rest_len = (argc + 1).saturating_sub(arity.real);
            if rest_len == 0 {
                Value::array(Vec::new())
            } else {
                Value::array(raw[i..i + rest_len].to_vec())
            }
        } else {
            raw[argc - (arity.real - i)].clone()
        };
        fixed.push(v);
    }
    fixed
}

/// [`fix_args`] when `raw` does not already have the shape the body expects.
pub fn fix_args_if_needed(raw: &[Value], arity: &Arity) -> Option<ArgBuffer> {
    arity.needs_fixing(raw.len()).then(|| fix_args(raw, arity))
}
