/// Panics in debug builds; logs an error via `tracing::error!` in release
/// builds. For states the broker should never reach but that are not worth
/// taking the whole process down for in production.
#[macro_export]
macro_rules! soft_panic {
    ($($arg:tt)*) => {
        if cfg!(debug_assertions) {
            panic!($($arg)*);
        } else {
            $crate::tracing::error!($($arg)*);
        }
    };
}
