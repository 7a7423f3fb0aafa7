//! RAII scoped spans over the global engine.

/// Emits a begin event on construction and the matching end event when the
/// scope unwinds, on any exit path.
#[must_use = "binding to `_` drops the guard immediately; use `let _scope = ...`"]
pub struct ScopedSpan {
    name: &'static str,
}

impl ScopedSpan {
    pub fn new(name: &'static str) -> Self {
        crate::emit_begin(name);
        Self { name }
    }
}

impl Drop for ScopedSpan {
    fn drop(&mut self) {
        crate::emit_end(self.name);
    }
}

/// Like [`ScopedSpan`], with a metadata payload on the begin record.
#[must_use = "binding to `_` drops the guard immediately; use `let _scope = ...`"]
pub struct MetaScopedSpan {
    name: &'static str,
}

impl MetaScopedSpan {
    pub fn new(name: &'static str, metadata: u64) -> Self {
        crate::emit_begin_meta(name, metadata);
        Self { name }
    }
}

impl Drop for MetaScopedSpan {
    fn drop(&mut self) {
        crate::emit_end(self.name);
    }
}

/// Open a scoped span named after the enclosing function.
///
/// ```
/// fn churn() {
///     lop::profile_scope!();
///     // ...
/// }
/// ```
#[macro_export]
macro_rules! profile_scope {
    () => {
        let _lop_scope = $crate::ScopedSpan::new({
            fn here() {}
            fn name_of<T>(_: T) -> &'static str {
                ::std::any::type_name::<T>()
            }
            let name = name_of(here);
            name.strip_suffix("::here").unwrap_or(name)
        });
    };
}

#[cfg(test)]
mod tests {
    // The guards drive the global engine, exercised end to end by the
    // integration tests. The engine is never enabled here, so these only pin
    // that construction, nesting and drop order compile and run.
    use super::*;

    #[test]
    fn guards_are_balanced() {
        {
            let _outer = ScopedSpan::new("outer");
            let _meta = MetaScopedSpan::new("inner", 9);
        }
        {
            profile_scope!();
        }
    }
}
