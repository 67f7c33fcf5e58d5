//! Native type encodings.
//!
//! Signatures use the single-character type codes of the native messaging
//! runtime, return type first: `v@:q` is a method returning void that takes
//! the receiver, the selector and a 64-bit integer. Frame offsets (`v24@0:8q16`)
//! and method qualifiers (`r n N o O R V`) are accepted and ignored.
use crate::error::BridgeError;
use serde::Serialize;
use std::{fmt, sync::Arc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NativeType {
    Void,
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    LongLong,
    ULongLong,
    Float,
    Double,
    Bool,
    /// `@`: a guest value passed as an object handle.
    Object,
    /// `#`: a class id.
    Class,
    /// `:`: a selector.
    Selector,
    /// `*`: a NUL-terminated string.
    CString,
    /// `^`: an untyped pointer.
    Pointer,
}

impl NativeType {
    pub fn from_code(c: char) -> Option<Self> {
        use NativeType::*;
        Some(match c {
            'v' => Void,
            'c' => Char,
            'C' => UChar,
            's' => Short,
            'S' => UShort,
            'i' => Int,
            'I' => UInt,
            'l' => Long,
            'L' => ULong,
            'q' => LongLong,
            'Q' => ULongLong,
            'f' => Float,
            'd' => Double,
            'B' => Bool,
            '@' => Object,
            '#' => Class,
            ':' => Selector,
            '*' => CString,
            '^' => Pointer,
            _ => return None,
        })
    }

    pub fn code(self) -> char {
        use NativeType::*;
        match self {
            Void => 'v',
            Char => 'c',
            UChar => 'C',
            Short => 's',
            UShort => 'S',
            Int => 'i',
            UInt => 'I',
            Long => 'l',
            ULong => 'L',
            LongLong => 'q',
            ULongLong => 'Q',
            Float => 'f',
            Double => 'd',
            Bool => 'B',
            Object => '@',
            Class => '#',
            Selector => ':',
            CString => '*',
            Pointer => '^',
        }
    }

    pub fn is_integer(self) -> bool {
        use NativeType::*;
        matches!(
            self,
            Char | UChar | Short | UShort | Int | UInt | Long | ULong | LongLong | ULongLong
        )
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TypeSignature {
    pub ret: NativeType,
    pub params: Vec<NativeType>,
    source: Arc<str>,
}

impl TypeSignature {
    pub fn parse(source: &str) -> Result<Self, BridgeError> {
        let bad = |msg: &str| BridgeError::BadSignature(source.to_string(), msg.to_string());

        let mut types = vec![];
        let mut chars = source.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                'r' | 'n' | 'N' | 'o' | 'O' | 'R' | 'V' => continue,
                c if c.is_ascii_digit() => continue,
                '{' | '(' | '[' | 'b' => return Err(bad("aggregate types are not supported")),
                '^' => {
                    // the pointee does not change how the pointer is passed
                    match chars.next() {
                        Some('{' | '(' | '[') => {
                            return Err(bad("pointers to aggregates are not supported"))
                        }
                        Some(_) => types.push(NativeType::Pointer),
                        None => return Err(bad("pointer without pointee")),
                    }
                }
                c => match NativeType::from_code(c) {
                    Some(t) => types.push(t),
                    None => return Err(bad(&format!("unknown type code '{c}'"))),
                },
            }
        }

        let mut types = types.into_iter();
        let ret = types.next().ok_or_else(|| bad("empty signature"))?;
        let params: Vec<_> = types.collect();
        if params.contains(&NativeType::Void) {
            return Err(bad("void is only valid as a return type"));
        }
        Ok(Self {
            ret,
            params,
            source: Arc::from(source),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Parameter types for a call with `argc` arguments. Arguments past the
    /// declared parameters of a variadic signature are passed as objects.
    pub fn params_for(&self, variadic: bool, argc: usize) -> Result<Vec<NativeType>, BridgeError> {
        let declared = self.params.len();
        if argc == declared || (variadic && argc > declared) {
            let mut params = self.params.clone();
            params.resize(argc, NativeType::Object);
            Ok(params)
        } else {
            Err(BridgeError::ArgumentCount {
                signature: self.source.to_string(),
                expected: declared,
                given: argc,
            })
        }
    }
}

impl fmt::Debug for TypeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeSignature({:?})", self.source)
    }
}

impl fmt::Display for TypeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
