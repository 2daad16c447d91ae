use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// An application message type that can travel through the client.
///
/// The wire-type name identifying the schema on the wire is the declared
/// [`CONTRACT_NAME`](Self::CONTRACT_NAME) when present, otherwise the
/// type's short name. Interoperability with other clients requires they
/// derive the same names.
pub trait MessageType: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Contract name override for the wire-type name.
    const CONTRACT_NAME: Option<&'static str> = None;
}

/// Computes the wire-type name for `T` without consulting any cache.
#[must_use]
pub fn wire_type_name<T: MessageType>() -> Arc<str> {
    T::CONTRACT_NAME.map_or_else(
        || Arc::from(short_name(std::any::type_name::<T>())),
        Arc::from,
    )
}

fn short_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Memoized map from application types to wire-type names. Entries are
/// add-only for the lifetime of the client.
#[derive(Debug, Default)]
pub struct TypeNameResolver {
    names: RwLock<HashMap<TypeId, Arc<str>>>,
}

impl TypeNameResolver {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the wire-type name for `T`, computing and caching it on
    /// first use. The compute function is pure, so a racing duplicate
    /// computation yields the same name.
    pub fn resolve<T: MessageType>(&self) -> Arc<str> {
        if let Some(name) = self
            .names
            .read()
            .expect("type name map poisoned")
            .get(&TypeId::of::<T>())
        {
            return name.clone();
        }

        self.names
            .write()
            .expect("type name map poisoned")
            .entry(TypeId::of::<T>())
            .or_insert_with(wire_type_name::<T>)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderPlaced {
        id: u64,
    }

    impl MessageType for OrderPlaced {}

    #[derive(Debug, Serialize, Deserialize)]
    struct Renamed;

    impl MessageType for Renamed {
        const CONTRACT_NAME: Option<&'static str> = Some("legacy.renamed");
    }

    #[test]
    fn defaults_to_short_name() {
        assert_eq!(&*wire_type_name::<OrderPlaced>(), "OrderPlaced");
    }

    #[test]
    fn contract_name_wins() {
        assert_eq!(&*wire_type_name::<Renamed>(), "legacy.renamed");
    }

    #[test]
    fn resolution_is_stable() {
        let resolver = TypeNameResolver::new();
        let first = resolver.resolve::<OrderPlaced>();
        let second = resolver.resolve::<OrderPlaced>();
        assert_eq!(first, second);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn generics_are_stripped() {
        assert_eq!(short_name("alloc::vec::Vec<alloc::string::String>"), "Vec");
        assert_eq!(short_name("plain"), "plain");
    }
}
