//! Declarative member copying between two serializable types.
//!
//! A map lists the destination members to write and where each one comes from. Every other
//! destination member keeps its value.

use serde::Serialize;
use serde::de::{DeserializeOwned, Error as _};
use serde_json::{Map, Value};
use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("no map from '{source_type}' to '{destination_type}'")]
    MissingMap {
        source_type: &'static str,
        destination_type: &'static str,
    },
    #[error("'{source_type}' has no member '{member}'")]
    UnknownSourceMember { source_type: &'static str, member: String },
    #[error("'{destination_type}' has no member '{member}'")]
    UnknownDestinationMember {
        destination_type: &'static str,
        member: String,
    },
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberMap {
    pub destination: String,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct TypeMap {
    source_type: &'static str,
    destination_type: &'static str,
    members: Vec<MemberMap>,
    skip_null_sources: bool,
}

impl TypeMap {
    fn new<S: 'static, D: 'static>() -> Self {
        Self {
            source_type: type_name::<S>(),
            destination_type: type_name::<D>(),
            members: Vec::new(),
            skip_null_sources: false,
        }
    }

    /// Copies the source member with the same name.
    pub fn member(&mut self, name: &str) -> &mut Self {
        self.member_from(name, name)
    }

    pub fn member_from(&mut self, destination: &str, source: &str) -> &mut Self {
        self.members.retain(|m| m.destination != destination);
        self.members.push(MemberMap {
            destination: destination.to_string(),
            source: source.to_string(),
        });
        self
    }

    /// A `null` source value leaves the destination member as it is.
    pub fn skip_null_sources(&mut self) -> &mut Self {
        self.skip_null_sources = true;
        self
    }

    pub fn members(&self) -> &[MemberMap] {
        &self.members
    }
}

#[derive(Debug, Default)]
pub struct MapperConfigurationBuilder {
    maps: HashMap<(TypeId, TypeId), TypeMap>,
}

impl MapperConfigurationBuilder {
    /// Starts (or replaces) the map from `S` to `D`.
    pub fn create_map<S: 'static, D: 'static>(&mut self) -> &mut TypeMap {
        self.maps
            .entry((TypeId::of::<S>(), TypeId::of::<D>()))
            .insert_entry(TypeMap::new::<S, D>())
            .into_mut()
    }
}

#[derive(Debug, Default)]
pub struct MapperConfiguration {
    maps: HashMap<(TypeId, TypeId), TypeMap>,
}

impl MapperConfiguration {
    pub fn new(configure: impl FnOnce(&mut MapperConfigurationBuilder)) -> Self {
        let mut builder = MapperConfigurationBuilder::default();
        configure(&mut builder);
        Self { maps: builder.maps }
    }

    pub fn type_map<S: 'static, D: 'static>(&self) -> Option<&TypeMap> {
        self.maps.get(&(TypeId::of::<S>(), TypeId::of::<D>()))
    }

    pub fn create_mapper(self) -> Mapper {
        Mapper::new(self)
    }
}

#[derive(Debug, Clone)]
pub struct Mapper {
    config: Arc<MapperConfiguration>,
}

fn as_object<T: Serialize>(value: &T) -> Result<Map<String, Value>, MappingError> {
    match serde_json::to_value(value)? {
        Value::Object(object) => Ok(object),
        other => Err(MappingError::Serialization(serde_json::Error::custom(format!(
            "'{}' does not serialize to an object: {other}",
            type_name::<T>()
        )))),
    }
}

impl Mapper {
    pub fn new(config: MapperConfiguration) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Copies the declared members of `source` onto `destination`.
    pub fn map<S, D>(&self, source: &S, destination: &mut D) -> Result<(), MappingError>
    where
        S: Serialize + 'static,
        D: Serialize + DeserializeOwned + 'static,
    {
        let map = self.config.type_map::<S, D>().ok_or(MappingError::MissingMap {
            source_type: type_name::<S>(),
            destination_type: type_name::<D>(),
        })?;

        let src = as_object(source)?;
        let mut dst = as_object(&*destination)?;

        for member in &map.members {
            let value = src
                .get(&member.source)
                .ok_or_else(|| MappingError::UnknownSourceMember {
                    source_type: map.source_type,
                    member: member.source.clone(),
                })?;
            if !dst.contains_key(&member.destination) {
                return Err(MappingError::UnknownDestinationMember {
                    destination_type: map.destination_type,
                    member: member.destination.clone(),
                });
            }
            if map.skip_null_sources && value.is_null() {
                continue;
            }
            dst.insert(member.destination.clone(), value.clone());
        }

        *destination = serde_json::from_value(Value::Object(dst))?;
        tracing::trace!(
            source = map.source_type,
            destination = map.destination_type,
            members = map.members.len(),
            "mapped"
        );
        Ok(())
    }
}
