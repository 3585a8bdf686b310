//! Deferred calls: a callable stored with its arguments and invoked later.

use crate::error::Result;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Type-erased value produced by an initializer.
pub type InitValue = Arc<dyn Any + Send + Sync>;

type CallFn = dyn Fn() -> Result<InitValue> + Send + Sync;

/// A named callable that can be registered now and invoked any number of
/// times later, without the caller knowing its signature.
#[derive(Clone)]
pub struct FunctionInstance {
    name: String,
    func: Arc<CallFn>,
}

impl FunctionInstance {
    pub fn new<F, V>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Result<V> + Send + Sync + 'static,
        V: Any + Send + Sync,
    {
        Self {
            name: name.into(),
            func: Arc::new(move || f().map(|v| Arc::new(v) as InitValue)),
        }
    }

    /// Bundle `f` with the argument it will be called with.
    pub fn bind<F, A, V>(name: impl Into<String>, f: F, args: A) -> Self
    where
        F: Fn(&A) -> Result<V> + Send + Sync + 'static,
        A: Send + Sync + 'static,
        V: Any + Send + Sync,
    {
        Self::new(name, move || f(&args))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn renamed(mut self, name: String) -> Self {
        self.name = name;
        self
    }

    pub fn call(&self) -> Result<InitValue> {
        (self.func)()
    }
}

impl fmt::Debug for FunctionInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionInstance")
            .field("name", &self.name)
            .finish()
    }
}

/// Read a typed value out of an [`InitValue`].
pub fn downcast<T: Any + Send + Sync>(value: &InitValue) -> Option<&T> {
    value.downcast_ref::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_call_returns_value() {
        let f = FunctionInstance::new("answer", || Ok(42u32));
        let value = f.call().unwrap();
        assert_eq!(downcast::<u32>(&value), Some(&42));
        assert_eq!(downcast::<String>(&value), None);
    }

    #[test]
    fn test_bind_captures_args() {
        let f = FunctionInstance::bind(
            "greeting",
            |who: &String| Ok(format!("hello {}", who)),
            "bridge".to_string(),
        );
        let value = f.call().unwrap();
        assert_eq!(downcast::<String>(&value).unwrap(), "hello bridge");

        // Callable more than once.
        assert!(f.call().is_ok());
    }

    #[test]
    fn test_errors_pass_through() {
        let f = FunctionInstance::new("broken", || -> Result<()> { Err(Error::other("nope")) });
        assert!(f.call().is_err());
        assert_eq!(f.name(), "broken");
    }
}
