//! Device management services: DeviceCommunicationControl,
//! ReinitializeDevice, time synchronization and unconfirmed COV notifications.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use log::{debug, info, warn};

use crate::app::dcc::CommunicationState;
use crate::app::{self, ApplicationLayer, ConfirmedRequest};
use crate::buffer::BacnetBuf;
use crate::encoding::{
    decode_context_character_string, decode_context_enumerated, decode_context_object_id,
    decode_context_unsigned, decode_date, decode_time, encode_closing_tag,
    encode_context_character_string, encode_context_enumerated, encode_context_object_id,
    encode_context_unsigned, encode_date, encode_opening_tag, encode_time, extract_constructed,
    has_context_tag, Result as EncodingResult,
};
use crate::network::BacnetAddress;
use crate::object::{ObjectIdentifier, PropertyIdentifier};
use crate::service::property::{BACNET_ARRAY_ALL, BACNET_MAX_PRIORITY, BACNET_MIN_PRIORITY};
use crate::service::{
    expect_end, ConfirmedServiceChoice, ErrorClass, ErrorCode, RejectReason, ServiceError,
    ServiceFailure,
};

/// Longest password the protocol allows.
pub const MAX_PASSWORD_LEN: usize = 20;

fn check_password(expected: Option<&str>, given: Option<&str>) -> Result<(), ServiceFailure> {
    match expected {
        None => Ok(()),
        Some(expected) if given == Some(expected) => Ok(()),
        Some(_) => Err(ServiceFailure::error(ErrorClass::Security, ErrorCode::PasswordFailure)),
    }
}

fn decode_password(data: &[u8], tag: u8) -> Result<(Option<String>, usize), ServiceFailure> {
    if !has_context_tag(data, tag) {
        return Ok((None, 0));
    }
    let (password, consumed) = decode_context_character_string(data, tag)
        .map_err(|_| ServiceFailure::Reject(RejectReason::InvalidTag))?;
    Ok((Some(password), consumed))
}

/// DeviceCommunicationControl-Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCommunicationControlRequest {
    /// Minutes; 0 means indefinite
    pub duration: u16,
    pub state: CommunicationState,
    pub password: Option<String>,
}

impl DeviceCommunicationControlRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<(), ServiceError> {
        if self.duration != 0 {
            encode_context_unsigned(buffer, 0, self.duration as u32)?;
        }
        encode_context_enumerated(buffer, 1, self.state as u32)?;
        if let Some(password) = &self.password {
            if password.is_empty() || password.len() > MAX_PASSWORD_LEN {
                return Err(ServiceError::InvalidParameters(format!(
                    "password must be 1..={} characters",
                    MAX_PASSWORD_LEN
                )));
            }
            encode_context_character_string(buffer, 2, password)?;
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self, ServiceFailure> {
        let mut pos = 0;
        let mut duration = 0;
        if has_context_tag(data, 0) {
            let (minutes, consumed) = decode_context_unsigned(data, 0)
                .map_err(|_| ServiceFailure::Reject(RejectReason::InvalidTag))?;
            duration = u16::try_from(minutes)
                .map_err(|_| ServiceFailure::Reject(RejectReason::ParameterOutOfRange))?;
            pos += consumed;
        }

        let (state, consumed) = decode_context_enumerated(&data[pos..], 1).map_err(|err| match err {
            crate::encoding::EncodingError::BufferUnderflow => {
                ServiceFailure::Reject(RejectReason::MissingRequiredParameter)
            }
            _ => ServiceFailure::Reject(RejectReason::InvalidTag),
        })?;
        pos += consumed;
        let state = CommunicationState::try_from(state)
            .map_err(|_| ServiceFailure::Reject(RejectReason::UndefinedEnumeration))?;

        let (password, consumed) = decode_password(&data[pos..], 2)?;
        pos += consumed;
        expect_end(data, pos)?;

        Ok(Self {
            duration,
            state,
            password,
        })
    }
}

pub fn handle_device_communication_control(
    app: &ApplicationLayer,
    request: &ConfirmedRequest<'_>,
    src: &BacnetAddress,
    reply: &mut BacnetBuf,
) -> Result<(), ServiceFailure> {
    let dcc = DeviceCommunicationControlRequest::decode(request.service_data)?;
    check_password(
        app.device_config().dcc_password.as_deref(),
        dcc.password.as_deref(),
    )?;

    info!(
        "DeviceCommunicationControl from {}: {:?} for {} minutes",
        src, dcc.state, dcc.duration
    );
    app.set_communication_control(dcc.state, dcc.duration);

    app::encode_simple_ack(
        reply,
        request.invoke_id,
        ConfirmedServiceChoice::DeviceCommunicationControl as u8,
    )?;
    Ok(())
}

/// State a device is asked to reinitialize into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ReinitializedState {
    ColdStart = 0,
    WarmStart = 1,
    StartBackup = 2,
    EndBackup = 3,
    StartRestore = 4,
    EndRestore = 5,
    AbortRestore = 6,
    ActivateChanges = 7,
}

impl TryFrom<u32> for ReinitializedState {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::ColdStart),
            1 => Ok(Self::WarmStart),
            2 => Ok(Self::StartBackup),
            3 => Ok(Self::EndBackup),
            4 => Ok(Self::StartRestore),
            5 => Ok(Self::EndRestore),
            6 => Ok(Self::AbortRestore),
            7 => Ok(Self::ActivateChanges),
            other => Err(other),
        }
    }
}

/// ReinitializeDevice-Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReinitializeDeviceRequest {
    pub state: ReinitializedState,
    pub password: Option<String>,
}

impl ReinitializeDeviceRequest {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> EncodingResult<()> {
        encode_context_enumerated(buffer, 0, self.state as u32)?;
        if let Some(password) = &self.password {
            encode_context_character_string(buffer, 1, password)?;
        }
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self, ServiceFailure> {
        if data.is_empty() {
            return Err(ServiceFailure::Reject(RejectReason::MissingRequiredParameter));
        }
        let (state, mut pos) = decode_context_enumerated(data, 0)
            .map_err(|_| ServiceFailure::Reject(RejectReason::InvalidTag))?;
        let state = ReinitializedState::try_from(state)
            .map_err(|_| ServiceFailure::Reject(RejectReason::UndefinedEnumeration))?;

        let (password, consumed) = decode_password(&data[pos..], 1)?;
        pos += consumed;
        expect_end(data, pos)?;

        Ok(Self { state, password })
    }
}

pub fn handle_reinitialize_device(
    app: &ApplicationLayer,
    request: &ConfirmedRequest<'_>,
    src: &BacnetAddress,
    reply: &mut BacnetBuf,
) -> Result<(), ServiceFailure> {
    let reinit = ReinitializeDeviceRequest::decode(request.service_data)?;
    check_password(
        app.device_config().reinitialize_password.as_deref(),
        reinit.password.as_deref(),
    )?;

    info!("ReinitializeDevice {:?} from {}", reinit.state, src);
    app.database().reinitialize(reinit.state)?;

    app::encode_simple_ack(reply, request.invoke_id, ConfirmedServiceChoice::ReinitializeDevice as u8)?;
    Ok(())
}

/// Service data of TimeSynchronization and UTCTimeSynchronization: an
/// application date followed by an application time.
pub fn encode_time_synchronization(buffer: &mut Vec<u8>, time: &NaiveDateTime) -> EncodingResult<()> {
    use chrono::{Datelike, Timelike};

    let date = time.date();
    let year = u16::try_from(date.year()).map_err(|_| crate::encoding::EncodingError::ValueOutOfRange)?;
    encode_date(
        buffer,
        year,
        date.month() as u8,
        date.day() as u8,
        date.weekday().number_from_monday() as u8,
    )?;
    encode_time(
        buffer,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
        (time.nanosecond() / 10_000_000) as u8,
    )
}

pub fn decode_time_synchronization(data: &[u8]) -> Result<NaiveDateTime, ServiceError> {
    let ((year, month, day, _weekday), mut pos) = decode_date(data)?;
    let ((hour, minute, second, hundredths), consumed) = decode_time(&data[pos..])?;
    pos += consumed;
    if pos != data.len() {
        return Err(ServiceError::InvalidParameters("trailing data".to_string()));
    }

    let date = Some(year)
        .filter(|&year| year != 255)
        .and_then(|year| NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32))
        .ok_or_else(|| ServiceError::InvalidParameters(format!("unspecified or invalid date {}-{}-{}", year, month, day)))?;
    let time = NaiveTime::from_hms_milli_opt(
        hour as u32,
        minute as u32,
        second as u32,
        hundredths as u32 * 10,
    )
    .ok_or_else(|| {
        ServiceError::InvalidParameters(format!(
            "unspecified or invalid time {}:{}:{}.{}",
            hour, minute, second, hundredths
        ))
    })?;
    Ok(NaiveDateTime::new(date, time))
}

fn synchronize(app: &ApplicationLayer, service_data: &[u8], src: &BacnetAddress, utc: bool) {
    match decode_time_synchronization(service_data) {
        Ok(time) => {
            debug!("time synchronization from {}: {}", src, time);
            app.database().synchronize_time(time, utc);
        }
        Err(e) => warn!("dropping time synchronization from {}: {}", src, e),
    }
}

pub fn handle_time_synchronization(app: &ApplicationLayer, service_data: &[u8], src: &BacnetAddress) {
    synchronize(app, service_data, src, false)
}

pub fn handle_utc_time_synchronization(app: &ApplicationLayer, service_data: &[u8], src: &BacnetAddress) {
    synchronize(app, service_data, src, true)
}

/// A property value carried by a COV notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyValue {
    pub property: PropertyIdentifier,
    pub array_index: Option<u32>,
    /// Application-encoded value
    pub value: Vec<u8>,
    pub priority: Option<u8>,
}

/// COV notification (confirmed or unconfirmed share the same body).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CovNotification {
    pub subscriber_process_id: u32,
    pub initiating_device: ObjectIdentifier,
    pub monitored_object: ObjectIdentifier,
    /// Seconds left on the subscription
    pub time_remaining: u32,
    pub values: Vec<PropertyValue>,
}

impl CovNotification {
    pub fn encode(&self, buffer: &mut Vec<u8>) -> EncodingResult<()> {
        encode_context_unsigned(buffer, 0, self.subscriber_process_id)?;
        let (object_type, instance) = self.initiating_device.raw_parts();
        encode_context_object_id(buffer, 1, object_type, instance)?;
        let (object_type, instance) = self.monitored_object.raw_parts();
        encode_context_object_id(buffer, 2, object_type, instance)?;
        encode_context_unsigned(buffer, 3, self.time_remaining)?;

        encode_opening_tag(buffer, 4)?;
        for value in &self.values {
            encode_context_enumerated(buffer, 0, value.property.into())?;
            if let Some(index) = value.array_index {
                encode_context_unsigned(buffer, 1, index)?;
            }
            encode_opening_tag(buffer, 2)?;
            buffer.extend_from_slice(&value.value);
            encode_closing_tag(buffer, 2)?;
            if let Some(priority) = value.priority {
                encode_context_unsigned(buffer, 3, priority as u32)?;
            }
        }
        encode_closing_tag(buffer, 4)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ServiceError> {
        let (subscriber_process_id, mut pos) = decode_context_unsigned(data, 0)?;
        let (initiating_device, consumed) = decode_context_object_id(&data[pos..], 1)?;
        pos += consumed;
        let (monitored_object, consumed) = decode_context_object_id(&data[pos..], 2)?;
        pos += consumed;
        let (time_remaining, consumed) = decode_context_unsigned(&data[pos..], 3)?;
        pos += consumed;

        let (list, consumed) = extract_constructed(&data[pos..], 4)?;
        pos += consumed;
        if pos != data.len() {
            return Err(ServiceError::InvalidParameters("trailing data".to_string()));
        }

        let mut values = Vec::new();
        let mut at = 0;
        while at < list.len() {
            let (property, consumed) = decode_context_enumerated(&list[at..], 0)?;
            at += consumed;

            let mut array_index = None;
            if has_context_tag(&list[at..], 1) {
                let (index, consumed) = decode_context_unsigned(&list[at..], 1)?;
                at += consumed;
                if index != BACNET_ARRAY_ALL {
                    array_index = Some(index);
                }
            }

            let (value, consumed) = extract_constructed(&list[at..], 2)?;
            at += consumed;

            let mut priority = None;
            if has_context_tag(&list[at..], 3) {
                let (p, consumed) = decode_context_unsigned(&list[at..], 3)?;
                at += consumed;
                match u8::try_from(p) {
                    Ok(p) if (BACNET_MIN_PRIORITY..=BACNET_MAX_PRIORITY).contains(&p) => priority = Some(p),
                    _ => {
                        return Err(ServiceError::InvalidParameters(format!("priority {} out of range", p)))
                    }
                }
            }

            values.push(PropertyValue {
                property: property.into(),
                array_index,
                value: value.to_vec(),
                priority,
            });
        }

        Ok(Self {
            subscriber_process_id,
            initiating_device: initiating_device.into(),
            monitored_object: monitored_object.into(),
            time_remaining,
            values,
        })
    }
}

pub fn handle_unconfirmed_cov_notification(app: &ApplicationLayer, service_data: &[u8], src: &BacnetAddress) {
    match CovNotification::decode(service_data) {
        Ok(notification) => app.database().cov_notification(src, &notification),
        Err(e) => warn!("dropping COV notification from {}: {}", src, e),
    }
}
