/// Aborts the process after logging an internal invariant violation.
///
/// Reserved for states that only a corrupted cache or a caller breaking the
/// calling convention can produce; guest-visible failures are
/// [`DispatchError`](crate::error::DispatchError)s instead.
#[macro_export]
macro_rules! fatal {
    ($($format:tt)*) => {{
        ::tracing::error!("fatal: {}", format_args!($($format)*));
        eprintln!("dispatch-rs fatal error: {}", format_args!($($format)*));
        ::std::process::abort()
    }};
}

/// Binds the payload of a [`Value`](crate::value::Value) variant or returns a
/// `TypeError` from the enclosing function.
#[macro_export]
macro_rules! vm_expect_value {
    (let $variant:ident ( $inner:ident ) = $v:expr, $expected:literal) => {
        let $inner = match $v {
            $crate::value::Value::$variant($inner) => $inner,
            other => {
                return Err($crate::error::DispatchError::Type(format!(
                    "wrong argument type {} (expected {})",
                    other.kind_name(),
                    $expected
                )))
            }
        };
    };
}

/// Emits a `trace!` event tagged with the calling thread's dispatch depth.
#[macro_export]
macro_rules! vm_trace {
    ($stack:expr, $($format:tt)*) => {
        ::tracing::trace!(depth = $stack.depth(), $($format)*)
    };
}

#[macro_export]
macro_rules! vm_debug {
    ($stack:expr, $($format:tt)*) => {
        ::tracing::debug!(depth = $stack.depth(), $($format)*)
    };
}
