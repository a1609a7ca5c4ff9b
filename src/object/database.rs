//! In-memory Object Database
//!
//! [`MemoryDatabase`] keeps every property as application-encoded bytes, so it
//! can serve ReadProperty, WriteProperty, ReadPropertyMultiple and ReadRange
//! without knowing what an analog input or a trend log is. Objects are added
//! by the application together with whatever properties it wants to expose.
//!
//! The Device object is created on construction. Its Object_List is derived
//! from the objects present and every object answers Property_List from the
//! properties it was given.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        RwLock,
    },
};

use log::{debug, trace};
use thiserror::Error;

use super::{
    ObjectDatabase, ObjectIdentifier, ObjectType, PropertyIdentifier, PropertyLists,
    PropertyReference,
};
use crate::encoding::{
    decode_character_string, element_len, encode_character_string, encode_context_bit_string,
    encode_context_unsigned, encode_closing_tag, encode_enumerated, encode_object_identifier,
    encode_opening_tag, encode_unsigned, EncodingError,
};
use crate::service::property::RangeSpec;
use crate::service::{ErrorClass, ErrorCode, RejectReason, ServiceFailure};
use crate::util::{read, write};

/// Database maintenance errors, as opposed to the protocol failures handed
/// back to requesters.
#[derive(Debug, Error, PartialEq)]
pub enum DatabaseError {
    #[error("object {0} already exists")]
    ObjectExists(ObjectIdentifier),
    #[error("object {0} does not exist")]
    UnknownObject(ObjectIdentifier),
    #[error("object name {0:?} already in use")]
    DuplicateName(String),
    #[error("the device object cannot be removed")]
    DeviceObject,
    #[error("property {0} is maintained by the database")]
    ReservedProperty(PropertyIdentifier),
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Shape of a stored property value. Every element is one application-encoded
/// value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    Single(Vec<u8>),
    Array(Vec<Vec<u8>>),
    List(Vec<Vec<u8>>),
}

#[derive(Debug, Clone)]
struct StoredProperty {
    id: PropertyIdentifier,
    value: StoredValue,
    writable: bool,
    required: bool,
}

#[derive(Debug, Clone)]
struct StoredObject {
    name: String,
    properties: Vec<StoredProperty>,
}

impl StoredObject {
    fn property(&self, id: PropertyIdentifier) -> Option<&StoredProperty> {
        self.properties.iter().find(|p| p.id == id)
    }

    fn property_mut(&mut self, id: PropertyIdentifier) -> Option<&mut StoredProperty> {
        self.properties.iter_mut().find(|p| p.id == id)
    }
}

/// Properties every object carries and the database answers itself.
const IDENTITY_PROPERTIES: [PropertyIdentifier; 3] = [
    PropertyIdentifier::ObjectIdentifier,
    PropertyIdentifier::ObjectName,
    PropertyIdentifier::ObjectType,
];

fn is_derived(property: PropertyIdentifier) -> bool {
    IDENTITY_PROPERTIES.contains(&property) || property == PropertyIdentifier::PropertyList
}

fn failure(class: ErrorClass, code: ErrorCode) -> ServiceFailure {
    ServiceFailure::error(class, code)
}

/// Splits a run of application-encoded values into its elements.
fn split_elements(mut data: &[u8]) -> std::result::Result<Vec<Vec<u8>>, ServiceFailure> {
    let mut elements = Vec::new();
    while !data.is_empty() {
        let len = element_len(data).map_err(|_| failure(ErrorClass::Property, ErrorCode::InvalidDataType))?;
        elements.push(data[..len].to_vec());
        data = &data[len..];
    }
    Ok(elements)
}

/// Appends one array element, the array length for index 0, or every element
/// when no index is given.
fn read_array(elements: &[Vec<u8>], index: Option<u32>, out: &mut Vec<u8>) -> std::result::Result<(), ServiceFailure> {
    match index {
        None => {
            elements.iter().for_each(|e| out.extend_from_slice(e));
            Ok(())
        }
        Some(0) => Ok(encode_unsigned(out, elements.len() as u32)?),
        Some(n) => {
            let element = elements
                .get(n as usize - 1)
                .ok_or_else(|| failure(ErrorClass::Property, ErrorCode::InvalidArrayIndex))?;
            out.extend_from_slice(element);
            Ok(())
        }
    }
}

/// Object database held entirely in memory.
pub struct MemoryDatabase {
    device: ObjectIdentifier,
    objects: RwLock<HashMap<ObjectIdentifier, StoredObject>>,
    names: RwLock<HashMap<String, ObjectIdentifier>>,
    /// Incremented on every structural change or successful write
    revision: AtomicU32,
}

impl MemoryDatabase {
    /// Creates a database holding only the Device object.
    pub fn new(device_instance: u32, device_name: &str) -> Self {
        let device = ObjectIdentifier::new(ObjectType::Device, device_instance);
        let mut objects = HashMap::new();
        objects.insert(
            device,
            StoredObject {
                name: device_name.to_string(),
                properties: Vec::new(),
            },
        );
        let mut names = HashMap::new();
        names.insert(device_name.to_string(), device);

        Self {
            device,
            objects: RwLock::new(objects),
            names: RwLock::new(names),
            revision: AtomicU32::new(1),
        }
    }

    pub fn device(&self) -> ObjectIdentifier {
        self.device
    }

    pub fn revision(&self) -> u32 {
        self.revision.load(Ordering::Relaxed)
    }

    fn bump_revision(&self) {
        self.revision.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_object(&self, id: ObjectIdentifier, name: &str) -> Result<()> {
        let mut objects = write(&self.objects);
        let mut names = write(&self.names);
        if objects.contains_key(&id) {
            return Err(DatabaseError::ObjectExists(id));
        }
        if names.contains_key(name) {
            return Err(DatabaseError::DuplicateName(name.to_string()));
        }

        objects.insert(
            id,
            StoredObject {
                name: name.to_string(),
                properties: Vec::new(),
            },
        );
        names.insert(name.to_string(), id);
        self.bump_revision();
        debug!("added object {} ({:?})", id, name);
        Ok(())
    }

    pub fn remove_object(&self, id: ObjectIdentifier) -> Result<()> {
        if id == self.device {
            return Err(DatabaseError::DeviceObject);
        }
        let mut objects = write(&self.objects);
        let object = objects.remove(&id).ok_or(DatabaseError::UnknownObject(id))?;
        write(&self.names).remove(&object.name);
        self.bump_revision();
        Ok(())
    }

    /// Stores `value` under `property`, replacing any previous value.
    ///
    /// Required properties are reported by the Required selector of
    /// ReadPropertyMultiple, the rest by Optional.
    pub fn set_property(
        &self,
        id: ObjectIdentifier,
        property: PropertyIdentifier,
        value: StoredValue,
        writable: bool,
        required: bool,
    ) -> Result<()> {
        if is_derived(property) || (id == self.device && property == PropertyIdentifier::ObjectList) {
            return Err(DatabaseError::ReservedProperty(property));
        }
        let mut objects = write(&self.objects);
        let object = objects.get_mut(&id).ok_or(DatabaseError::UnknownObject(id))?;
        let stored = StoredProperty {
            id: property,
            value,
            writable,
            required,
        };
        match object.property_mut(property) {
            Some(existing) => *existing = stored,
            None => object.properties.push(stored),
        }
        self.bump_revision();
        Ok(())
    }

    /// Current stored value of a property, as the application left it or a
    /// peer wrote it.
    pub fn get_property(&self, id: ObjectIdentifier, property: PropertyIdentifier) -> Option<StoredValue> {
        read(&self.objects)
            .get(&id)
            .and_then(|object| object.property(property))
            .map(|p| p.value.clone())
    }

    pub fn object_count(&self) -> usize {
        read(&self.objects).len()
    }

    fn object_list(&self, objects: &HashMap<ObjectIdentifier, StoredObject>) -> std::result::Result<Vec<Vec<u8>>, EncodingError> {
        let mut ids: Vec<ObjectIdentifier> = objects.keys().copied().collect();
        ids.sort_by_key(|id| (id != &self.device, u32::from(*id)));
        ids.into_iter()
            .map(|id| {
                let (object_type, instance) = id.raw_parts();
                let mut element = Vec::with_capacity(5);
                encode_object_identifier(&mut element, object_type, instance)?;
                Ok(element)
            })
            .collect()
    }
}

impl ObjectDatabase for MemoryDatabase {
    fn read_property(&self, reference: &PropertyReference, out: &mut Vec<u8>) -> std::result::Result<(), ServiceFailure> {
        let objects = read(&self.objects);
        let object = objects
            .get(&reference.object)
            .ok_or_else(|| failure(ErrorClass::Object, ErrorCode::UnknownObject))?;
        trace!("read {} {}", reference.object, reference.property);

        let scalar = |out: &mut Vec<u8>| -> std::result::Result<(), ServiceFailure> {
            if reference.array_index.is_some() {
                return Err(failure(ErrorClass::Property, ErrorCode::PropertyIsNotAnArray));
            }
            match reference.property {
                PropertyIdentifier::ObjectIdentifier => {
                    let (object_type, instance) = reference.object.raw_parts();
                    encode_object_identifier(out, object_type, instance)?;
                }
                PropertyIdentifier::ObjectName => encode_character_string(out, &object.name)?,
                _ => encode_enumerated(out, u16::from(reference.object.object_type) as u32)?,
            }
            Ok(())
        };

        match reference.property {
            p if IDENTITY_PROPERTIES.contains(&p) => scalar(out),
            PropertyIdentifier::PropertyList => {
                let mut elements = Vec::with_capacity(object.properties.len());
                for property in &object.properties {
                    let mut element = Vec::new();
                    encode_enumerated(&mut element, property.id.into())?;
                    elements.push(element);
                }
                read_array(&elements, reference.array_index, out)
            }
            PropertyIdentifier::ObjectList if reference.object == self.device => {
                read_array(&self.object_list(&objects)?, reference.array_index, out)
            }
            property => {
                let stored = object
                    .property(property)
                    .ok_or_else(|| failure(ErrorClass::Property, ErrorCode::UnknownProperty))?;
                match &stored.value {
                    StoredValue::Array(elements) => read_array(elements, reference.array_index, out),
                    StoredValue::Single(_) | StoredValue::List(_) if reference.array_index.is_some() => {
                        Err(failure(ErrorClass::Property, ErrorCode::PropertyIsNotAnArray))
                    }
                    StoredValue::Single(value) => {
                        out.extend_from_slice(value);
                        Ok(())
                    }
                    StoredValue::List(items) => {
                        items.iter().for_each(|item| out.extend_from_slice(item));
                        Ok(())
                    }
                }
            }
        }
    }

    fn write_property(
        &self,
        reference: &PropertyReference,
        value: &[u8],
        priority: Option<u8>,
    ) -> std::result::Result<(), ServiceFailure> {
        let mut objects = write(&self.objects);
        let object = objects
            .get_mut(&reference.object)
            .ok_or_else(|| failure(ErrorClass::Object, ErrorCode::UnknownObject))?;

        if is_derived(reference.property)
            || (reference.object == self.device && reference.property == PropertyIdentifier::ObjectList)
        {
            return Err(failure(ErrorClass::Property, ErrorCode::WriteAccessDenied));
        }
        let stored = object
            .property_mut(reference.property)
            .ok_or_else(|| failure(ErrorClass::Property, ErrorCode::UnknownProperty))?;
        if !stored.writable {
            return Err(failure(ErrorClass::Property, ErrorCode::WriteAccessDenied));
        }

        let mut elements = split_elements(value)?;
        match (&mut stored.value, reference.array_index) {
            (StoredValue::Array(_), Some(0)) => {
                return Err(failure(ErrorClass::Property, ErrorCode::WriteAccessDenied))
            }
            (StoredValue::Array(array), Some(index)) => {
                if elements.len() != 1 {
                    return Err(failure(ErrorClass::Property, ErrorCode::InvalidDataType));
                }
                let slot = array
                    .get_mut(index as usize - 1)
                    .ok_or_else(|| failure(ErrorClass::Property, ErrorCode::InvalidArrayIndex))?;
                *slot = elements.remove(0);
            }
            (_, Some(_)) => return Err(failure(ErrorClass::Property, ErrorCode::PropertyIsNotAnArray)),
            (StoredValue::Single(single), None) => {
                if elements.len() != 1 {
                    return Err(failure(ErrorClass::Property, ErrorCode::InvalidDataType));
                }
                *single = elements.remove(0);
            }
            (StoredValue::Array(array), None) => *array = elements,
            (StoredValue::List(list), None) => *list = elements,
        }

        debug!(
            "wrote {} {} (priority {:?})",
            reference.object, reference.property, priority
        );
        self.bump_revision();
        Ok(())
    }

    fn property_lists(&self, object: ObjectIdentifier) -> Option<PropertyLists> {
        let objects = read(&self.objects);
        let stored = objects.get(&object)?;

        let mut lists = PropertyLists {
            required: IDENTITY_PROPERTIES.to_vec(),
            optional: Vec::new(),
        };
        if object == self.device {
            lists.required.push(PropertyIdentifier::ObjectList);
        }
        for property in &stored.properties {
            if property.required {
                lists.required.push(property.id);
            } else {
                lists.optional.push(property.id);
            }
        }
        Some(lists)
    }

    fn read_range(
        &self,
        reference: &PropertyReference,
        range: &RangeSpec,
        out: &mut Vec<u8>,
    ) -> std::result::Result<(), ServiceFailure> {
        let objects = read(&self.objects);
        let object = objects
            .get(&reference.object)
            .ok_or_else(|| failure(ErrorClass::Object, ErrorCode::UnknownObject))?;
        let stored = object
            .property(reference.property)
            .ok_or_else(|| failure(ErrorClass::Property, ErrorCode::UnknownProperty))?;
        let items = match &stored.value {
            StoredValue::List(items) => items,
            _ => return Err(failure(ErrorClass::Property, ErrorCode::PropertyIsNotAList)),
        };
        if reference.array_index.is_some() {
            return Err(failure(ErrorClass::Property, ErrorCode::PropertyIsNotAnArray));
        }

        // 1-based inclusive positions
        let selected = match *range {
            RangeSpec::All => (!items.is_empty()).then(|| (1, items.len())),
            RangeSpec::ByPosition { count: 0, .. } => {
                return Err(ServiceFailure::Reject(RejectReason::ParameterOutOfRange))
            }
            RangeSpec::ByPosition { reference_index, count } => {
                let reference_index = reference_index as usize;
                if reference_index == 0 || reference_index > items.len() {
                    None
                } else if count > 0 {
                    let last = (reference_index + count as usize - 1).min(items.len());
                    Some((reference_index, last))
                } else {
                    let first = reference_index.saturating_sub(count.unsigned_abs() as usize - 1).max(1);
                    Some((first, reference_index))
                }
            }
            RangeSpec::BySequenceNumber { .. } | RangeSpec::ByTime { .. } => {
                return Err(failure(ErrorClass::Services, ErrorCode::OptionalFunctionalityNotSupported))
            }
        };

        let (first_item, last_item, count) = match selected {
            Some((first, last)) => (first == 1, last == items.len(), last - first + 1),
            None => (false, false, 0),
        };
        encode_context_bit_string(out, 3, &[first_item, last_item, false])?;
        encode_context_unsigned(out, 4, count as u32)?;
        encode_opening_tag(out, 5)?;
        if let Some((first, last)) = selected {
            items[first - 1..last].iter().for_each(|item| out.extend_from_slice(item));
        }
        encode_closing_tag(out, 5)?;
        Ok(())
    }

    fn object_name(&self, object: ObjectIdentifier) -> Option<String> {
        read(&self.objects).get(&object).map(|o| o.name.clone())
    }

    fn find_object_by_name(&self, name: &str) -> Option<ObjectIdentifier> {
        read(&self.names).get(name).copied()
    }
}

/// Decodes an application-encoded character string, for callers inspecting
/// stored names or values.
pub fn decode_name(value: &[u8]) -> Option<String> {
    decode_character_string(value).ok().map(|(name, _)| name)
}
