//! Assertion macros shared by the suites

/// Unwrap an `Ok`, panicking with the error's debug form otherwise
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => panic!("operation failed: {:?}", error),
        }
    };
    ($result:expr, $context:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => panic!("{} failed: {:?}", $context, error),
        }
    };
}

/// Check that a result is an `Err`, optionally matching a pattern
#[macro_export]
macro_rules! assert_err {
    ($result:expr) => {
        if let Ok(value) = $result {
            panic!("expected an error, got {:?}", value);
        }
    };
    ($result:expr, $pattern:pat) => {
        match $result {
            Err($pattern) => {}
            Err(other) => panic!("wrong error: {:?}", other),
            Ok(value) => panic!("expected an error, got {:?}", value),
        }
    };
}
