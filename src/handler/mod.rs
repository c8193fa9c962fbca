//! Application handler interface.
//!
//! The engine keeps the active handler inside its configuration snapshot,
//! so swapping handlers is an atomic pointer replacement: requests already
//! dispatched finish with the handler they started with.

use std::sync::Arc;

use crate::connection::Connection;

/// Error an application handler may return. The engine logs it and, if
/// nothing was flushed yet, answers 500.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<(), HandlerError>;

/// Application callback invoked on a worker thread for every request that
/// passes the filters.
pub trait Handler: Send + Sync {
    fn handle(&self, conn: &mut Connection) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&mut Connection) -> HandlerResult + Send + Sync,
{
    fn handle(&self, conn: &mut Connection) -> HandlerResult {
        self(conn)
    }
}

/// Shared handler reference as stored in a snapshot.
pub type HandlerRef = Arc<dyn Handler>;

/// Wrap a handler (or closure) into a [`HandlerRef`].
pub fn handler_ref<H>(handler: H) -> HandlerRef
where
    H: Handler + 'static,
{
    Arc::new(handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::EngineConfig;
    use crate::connection::{sink, RequestView};
    use crate::session::SessionStore;

    struct Greeter;

    impl Handler for Greeter {
        fn handle(&self, conn: &mut Connection) -> HandlerResult {
            conn.response_mut().set_body("hi");
            Ok(())
        }
    }

    #[test]
    fn test_closures_and_types_are_handlers() {
        let handlers: Vec<HandlerRef> = vec![
            handler_ref(Greeter),
            handler_ref(|conn: &mut Connection| -> HandlerResult {
                conn.response_mut().set_body("hi");
                Ok(())
            }),
        ];
        for handler in handlers {
            let (tx, _rx) = sink::channel(std::time::Duration::from_secs(5));
            let mut conn = Connection::new(
                RequestView::builder("GET", "/").build(),
                Arc::new(EngineConfig::default()),
                SessionStore::new(),
                Box::new(tx),
            );
            handler.handle(&mut conn).unwrap();
            assert_eq!(conn.response().body(), b"hi");
        }
    }
}
