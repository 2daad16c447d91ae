use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};

type EventCallback = Arc<dyn Fn(&dyn Any, Option<&str>) + Send + Sync>;

/// Routes events to explicitly registered per-type callbacks, optionally
/// scoped to a bounded context. Registrations are add-only for the
/// lifetime of the dispatcher.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<HashMap<TypeId, Vec<EventCallback>>>,
}

impl EventDispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for events of type `T`. The callback receives
    /// the event and the bounded context it was dispatched in, if any.
    pub fn register<T: Any>(&self, callback: impl Fn(&T, Option<&str>) + Send + Sync + 'static) {
        let erased: EventCallback = Arc::new(move |event, context| {
            if let Some(event) = event.downcast_ref::<T>() {
                callback(event, context);
            }
        });

        self.handlers
            .write()
            .expect("dispatcher poisoned")
            .entry(TypeId::of::<T>())
            .or_default()
            .push(erased);
    }

    /// Dispatches an event to every callback registered for its type.
    pub fn dispatch<T: Any>(&self, event: &T) {
        self.dispatch_erased(event, None);
    }

    /// Dispatches an event within a named bounded context.
    pub fn dispatch_in_context<T: Any>(&self, event: &T, bounded_context: &str) {
        self.dispatch_erased(event, Some(bounded_context));
    }

    // Snapshot the callback list, invoke outside the lock.
    fn dispatch_erased<T: Any>(&self, event: &T, context: Option<&str>) {
        let callbacks = self
            .handlers
            .read()
            .expect("dispatcher poisoned")
            .get(&TypeId::of::<T>())
            .cloned();

        if let Some(callbacks) = callbacks {
            for callback in callbacks {
                callback(event, context);
            }
        }
    }
}

impl Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field(
                "registered_types",
                &self.handlers.read().expect("dispatcher poisoned").len(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    #[derive(Debug)]
    struct AccountOpened {
        id: u32,
    }

    #[derive(Debug)]
    struct AccountClosed;

    #[test]
    fn dispatches_to_every_callback_for_the_type() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let seen = seen.clone();
            dispatcher.register::<AccountOpened>(move |event, _| {
                seen.lock().unwrap().push(event.id);
            });
        }

        dispatcher.dispatch(&AccountOpened { id: 5 });
        assert_eq!(*seen.lock().unwrap(), vec![5, 5]);
    }

    #[test]
    fn other_types_are_not_invoked() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(0_u32));

        let count = seen.clone();
        dispatcher.register::<AccountOpened>(move |_, _| {
            *count.lock().unwrap() += 1;
        });

        dispatcher.dispatch(&AccountClosed);
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[test]
    fn bounded_context_reaches_the_callback() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(None));

        let context = seen.clone();
        dispatcher.register::<AccountOpened>(move |_, ctx| {
            *context.lock().unwrap() = ctx.map(str::to_string);
        });

        dispatcher.dispatch_in_context(&AccountOpened { id: 1 }, "billing");
        assert_eq!(seen.lock().unwrap().as_deref(), Some("billing"));

        dispatcher.dispatch(&AccountOpened { id: 2 });
        assert_eq!(*seen.lock().unwrap(), None);
    }
}
