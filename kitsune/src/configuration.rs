//! Property configuration lookups and the tag-invalidated cache in front of
//! them.

use std::{collections::HashSet, sync::Arc};

use dashmap::DashMap;
use kitsune_common::{Category, EntityId, PropertyMeta};

/// Read access to the configuration of properties
pub trait ConfigurationLookup: Send + Sync {
    fn by_id(&self, id: &EntityId) -> Option<PropertyMeta>;

    /// Ids of every property owned by a connector, directly or through its
    /// devices and channels
    fn by_connector(&self, connector: &EntityId) -> Vec<EntityId>;
}

/// Configuration held in process, mutated by whoever owns it
#[derive(Default)]
pub struct InMemoryConfiguration {
    properties: DashMap<EntityId, PropertyMeta>,
}

impl InMemoryConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, meta: PropertyMeta) -> Option<PropertyMeta> {
        self.properties.insert(meta.id.clone(), meta)
    }

    pub fn remove(&self, id: &EntityId) -> Option<PropertyMeta> {
        self.properties.remove(id).map(|(_, meta)| meta)
    }
}

impl ConfigurationLookup for InMemoryConfiguration {
    fn by_id(&self, id: &EntityId) -> Option<PropertyMeta> {
        self.properties.get(id).map(|meta| meta.clone())
    }

    fn by_connector(&self, connector: &EntityId) -> Vec<EntityId> {
        let mut ids = self
            .properties
            .iter()
            .filter(|meta| meta.owner.connector() == connector)
            .map(|meta| meta.id.clone())
            .collect::<Vec<_>>();

        ids.sort();
        ids
    }
}

/// A change to the configuration, as announced by its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationChange {
    PropertyCreated(EntityId),
    PropertyUpdated(EntityId),
    PropertyDeleted(EntityId),
    /// A connector, device or channel changed
    EntityUpdated(EntityId),
    EntityDeleted(EntityId),
    /// The connector rediscovered its devices
    Rediscovered(EntityId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheTag {
    Entity(EntityId),
    Category(Category),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Property(EntityId),
    Listing(EntityId),
}

/// Cache of property metadata, invalidated by tag.
///
/// Every cached property is tagged with its own id, each id of its owner
/// chain and its owner category. Connector listings are tagged with the
/// connector and every listed property; a created or updated property also
/// drops the listing of its old and new connector.
pub struct ConfigurationCache {
    lookup: Arc<dyn ConfigurationLookup>,
    properties: DashMap<EntityId, Arc<PropertyMeta>>,
    listings: DashMap<EntityId, Arc<[EntityId]>>,
    tags: DashMap<CacheTag, HashSet<CacheKey>>,
}

impl ConfigurationCache {
    pub fn new(lookup: Arc<dyn ConfigurationLookup>) -> Self {
        Self {
            lookup,
            properties: DashMap::new(),
            listings: DashMap::new(),
            tags: DashMap::new(),
        }
    }

    /// Metadata of a property, `None` if it is not configured
    pub fn get(&self, id: &EntityId) -> Option<Arc<PropertyMeta>> {
        if let Some(meta) = self.properties.get(id) {
            return Some(meta.clone());
        }

        let meta = Arc::new(self.lookup.by_id(id)?);
        let key = CacheKey::Property(id.clone());

        for entity in meta.owner.ids().into_iter().chain([id]) {
            self.tag(CacheTag::Entity(entity.clone()), key.clone());
        }
        self.tag(CacheTag::Category(meta.owner.category()), key);

        self.properties.insert(id.clone(), meta.clone());

        Some(meta)
    }

    /// Ids of the properties owned by a connector
    pub fn properties_of(&self, connector: &EntityId) -> Arc<[EntityId]> {
        if let Some(listing) = self.listings.get(connector) {
            return listing.clone();
        }

        let listing: Arc<[EntityId]> = self.lookup.by_connector(connector).into();
        let key = CacheKey::Listing(connector.clone());

        for entity in listing.iter().chain([connector]) {
            self.tag(CacheTag::Entity(entity.clone()), key.clone());
        }

        self.listings.insert(connector.clone(), listing.clone());

        listing
    }

    fn tag(&self, tag: CacheTag, key: CacheKey) {
        self.tags.entry(tag).or_default().insert(key);
    }

    /// Drop every entry carrying `tag`
    pub fn invalidate(&self, tag: &CacheTag) {
        let Some((_, keys)) = self.tags.remove(tag) else {
            return;
        };

        tracing::debug!(?tag, entries = keys.len(), "invalidating configuration cache");

        for key in keys {
            match key {
                CacheKey::Property(id) => {
                    self.properties.remove(&id);
                }
                CacheKey::Listing(connector) => {
                    self.listings.remove(&connector);
                }
            }
        }
    }

    pub fn apply(&self, change: &ConfigurationChange) {
        match change {
            ConfigurationChange::PropertyCreated(id) | ConfigurationChange::PropertyUpdated(id) => {
                let previous = self.properties.get(id).map(|meta| meta.owner.connector().clone());

                self.invalidate(&CacheTag::Entity(id.clone()));

                let current = self.lookup.by_id(id).map(|meta| meta.owner.connector().clone());

                for connector in previous.into_iter().chain(current) {
                    self.listings.remove(&connector);
                }
            }
            ConfigurationChange::PropertyDeleted(id)
            | ConfigurationChange::EntityUpdated(id)
            | ConfigurationChange::EntityDeleted(id)
            | ConfigurationChange::Rediscovered(id) => {
                self.invalidate(&CacheTag::Entity(id.clone()));
            }
        }
    }

    pub fn clear(&self) {
        self.properties.clear();
        self.listings.clear();
        self.tags.clear();
    }
}
