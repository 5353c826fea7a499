//! Built-in handlers and the column conversions they are made of.
//!
//! Physical representation per target:
//!
//! | semantic      | Default            | FlatFile         | ColumnarArchive | Relational (DDL)           |
//! |---------------|--------------------|------------------|-----------------|----------------------------|
//! | Categorical   | Dict(Int32, Utf8)  | Utf8             | Utf8            | Utf8 `VARCHAR(255)`        |
//! | Identifier    | Dict(Int32, Int64) | Float64          | Float64         | Int64 `BIGINT`             |
//! | Datetime      | Timestamp(ns)      | Utf8 text        | Timestamp(ns)   | Timestamp(ns) `TIMESTAMP`  |
//! | Duration      | Duration(ns)       | Int64 ns         | Duration(ns)    | Duration(ns) `INTERVAL`    |
//! | EpochDatetime | Timestamp(ms)      | Float64 seconds  | Float64 seconds | Timestamp(ms) `TIMESTAMP`  |
//! | Numeric       | Float64            | Float64          | Float64         | Float64 `DOUBLE PRECISION` |
//! | Boolean       | Boolean            | Boolean          | Boolean         | Boolean `BOOLEAN`          |
//! | Raw           | any                | Utf8             | any             | Utf8 `TEXT`                |
//!
//! `ColumnarArchiveEncoded` is `ColumnarArchive` with the Default dictionary
//! handlers for Categorical and Identifier. `RelationalEncoded` is `Relational`
//! with Categorical stored as `Int64` codes (`INT`). Identifier dictionaries
//! may also hold `Utf8` values in memory.
//!
//! A `Raw` column under a target that accepts anything reports `DataType::Null`
//! as its physical type.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, DurationMicrosecondArray,
    DurationMillisecondArray, DurationNanosecondArray, DurationSecondArray, Float64Array,
    Int64Array, StringArray, TimestampMicrosecondArray, TimestampMillisecondArray,
    TimestampNanosecondArray, TimestampSecondArray,
};
use arrow::compute::kernels::cast::{cast, cast_with_options, CastOptions};
use arrow::datatypes::{
    ArrowPrimitiveType, DataType, DurationMicrosecondType, DurationMillisecondType,
    DurationNanosecondType, DurationSecondType, Float64Type, Int64Type, TimeUnit,
    TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType,
};
use arrow::temporal_conversions::timestamp_ns_to_datetime;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use chrono::{DateTime, NaiveDate, NaiveDateTime};

use super::{ColumnMetadata, Handlers, TypeRegistryBuilder};
use crate::chunks::dictionary::{self, as_int32_dictionary, is_int32_dictionary};
use crate::error::TabularError;
use crate::schema::Column;
use crate::types::{SemanticType, StorageTarget};

/// Text format of datetimes in flat files. Fractional seconds are written only
/// when present.
pub const FLAT_FILE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

//==================================================================================
// I. Registration
//==================================================================================

pub(crate) fn register_builtin(builder: TypeRegistryBuilder) -> TypeRegistryBuilder {
    use SemanticType::*;

    let default = StorageTarget::Default;
    let flat = StorageTarget::FlatFile;
    let archive = StorageTarget::ColumnarArchive;
    let relational = StorageTarget::Relational;

    let builder = builder
        .register(Categorical, default.clone(), categorical_dictionary())
        .register(Identifier, default.clone(), identifier_dictionary())
        .register(Datetime, default.clone(), timestamp(TimeUnit::Nanosecond, None))
        .register(Duration, default.clone(), duration_ns(None))
        .register(EpochDatetime, default.clone(), timestamp(TimeUnit::Millisecond, None))
        .register(Numeric, default.clone(), float64(None))
        .register(Boolean, default.clone(), boolean(None))
        .register(Raw, default, raw_any());

    let builder = builder
        .register(Categorical, flat.clone(), text(None))
        .register(Identifier, flat.clone(), Handlers::for_type(DataType::Float64, None, to_identifier_float64))
        .register(Datetime, flat.clone(), Handlers::for_type(DataType::Utf8, None, to_datetime_text))
        .register(Duration, flat.clone(), Handlers::for_type(DataType::Int64, None, to_duration_int64))
        .register(EpochDatetime, flat.clone(), epoch_seconds())
        .register(Numeric, flat.clone(), float64(None))
        .register(Boolean, flat.clone(), boolean(None))
        .register(Raw, flat, text(None));

    let builder = builder
        .register(Categorical, archive.clone(), text(None))
        .register(Identifier, archive.clone(), Handlers::for_type(DataType::Float64, None, to_identifier_float64))
        .register(Datetime, archive.clone(), timestamp(TimeUnit::Nanosecond, None))
        .register(Duration, archive.clone(), duration_ns(None))
        .register(EpochDatetime, archive.clone(), epoch_seconds())
        .register(Numeric, archive.clone(), float64(None))
        .register(Boolean, archive.clone(), boolean(None))
        .register(Raw, archive.clone(), raw_any());

    let builder = builder
        .alias_target(&archive, StorageTarget::ColumnarArchiveEncoded)
        .register(Categorical, StorageTarget::ColumnarArchiveEncoded, categorical_dictionary())
        .register(Identifier, StorageTarget::ColumnarArchiveEncoded, identifier_dictionary());

    builder
        .register(Categorical, relational.clone(), text(Some("VARCHAR(255)")))
        .register(Identifier, relational.clone(), Handlers::for_type(DataType::Int64, Some("BIGINT"), to_identifier_int64))
        .register(Datetime, relational.clone(), timestamp(TimeUnit::Nanosecond, Some("TIMESTAMP")))
        .register(Duration, relational.clone(), duration_ns(Some("INTERVAL")))
        .register(EpochDatetime, relational.clone(), timestamp(TimeUnit::Millisecond, Some("TIMESTAMP")))
        .register(Numeric, relational.clone(), float64(Some("DOUBLE PRECISION")))
        .register(Boolean, relational.clone(), boolean(Some("BOOLEAN")))
        .register(Raw, relational.clone(), text(Some("TEXT")))
        .alias_target(&relational, StorageTarget::RelationalEncoded)
        .register(
            Categorical,
            StorageTarget::RelationalEncoded,
            Handlers::for_type(DataType::Int64, Some("INT"), to_category_codes),
        )
}

fn categorical_dictionary() -> Handlers {
    Handlers::new(
        |_, array| Ok(is_dictionary_of(array.data_type(), &[DataType::Utf8])),
        to_categorical,
        |column| ColumnMetadata {
            name: column.name.clone(),
            physical_type: dictionary_type(DataType::Utf8),
            ddl: None,
        },
    )
}

fn identifier_dictionary() -> Handlers {
    Handlers::new(
        |_, array| {
            Ok(is_dictionary_of(
                array.data_type(),
                &[DataType::Int64, DataType::Utf8],
            ))
        },
        to_identifier,
        |column| ColumnMetadata {
            name: column.name.clone(),
            physical_type: dictionary_type(DataType::Int64),
            ddl: None,
        },
    )
}

fn timestamp(unit: TimeUnit, ddl: Option<&'static str>) -> Handlers {
    let transform: fn(&Column, &ArrayRef) -> Result<ArrayRef, TabularError> = match unit {
        TimeUnit::Millisecond => to_timestamp_ms,
        _ => to_timestamp_ns,
    };
    Handlers::for_type(DataType::Timestamp(unit, None), ddl, transform)
}

fn duration_ns(ddl: Option<&'static str>) -> Handlers {
    Handlers::for_type(DataType::Duration(TimeUnit::Nanosecond), ddl, to_duration_ns)
}

fn float64(ddl: Option<&'static str>) -> Handlers {
    Handlers::for_type(DataType::Float64, ddl, to_float64)
}

fn boolean(ddl: Option<&'static str>) -> Handlers {
    Handlers::for_type(DataType::Boolean, ddl, to_boolean)
}

fn text(ddl: Option<&'static str>) -> Handlers {
    Handlers::for_type(DataType::Utf8, ddl, to_text)
}

fn epoch_seconds() -> Handlers {
    Handlers::for_type(DataType::Float64, None, to_epoch_seconds)
}

fn raw_any() -> Handlers {
    Handlers::new(
        |_, _| Ok(true),
        |_, array| Ok(array.clone()),
        |column| ColumnMetadata {
            name: column.name.clone(),
            physical_type: DataType::Null,
            ddl: None,
        },
    )
}

pub fn dictionary_type(value_type: DataType) -> DataType {
    DataType::Dictionary(Box::new(DataType::Int32), Box::new(value_type))
}

fn is_dictionary_of(data_type: &DataType, value_types: &[DataType]) -> bool {
    match data_type {
        DataType::Dictionary(_, values) if is_int32_dictionary(data_type) => {
            value_types.contains(values.as_ref())
        }
        _ => false,
    }
}

//==================================================================================
// II. Dictionary-coded columns
//==================================================================================

/// Any input to `Dictionary(Int32, Utf8)`. Existing `Int32` codes are kept.
pub fn to_categorical(column: &Column, array: &ArrayRef) -> Result<ArrayRef, TabularError> {
    if is_int32_dictionary(array.data_type()) {
        let coded = as_int32_dictionary(array)?;
        let values = to_text(column, coded.values())?;
        return dictionary::build(coded.keys().clone(), values);
    }
    let plain = to_text(column, &dictionary::decode(array)?)?;
    let dict = dictionary::dictionary_of(&plain)?;
    dictionary::recode_as(&plain, &dict, &DataType::Utf8)
}

/// Any input to `Dictionary(Int32, Int64 | Utf8)`. Floating point ids must be
/// integral.
pub fn to_identifier(column: &Column, array: &ArrayRef) -> Result<ArrayRef, TabularError> {
    if is_int32_dictionary(array.data_type()) {
        let coded = as_int32_dictionary(array)?;
        let values = identifier_values(column, coded.values())?;
        return dictionary::build(coded.keys().clone(), values);
    }
    let plain = identifier_values(column, &dictionary::decode(array)?)?;
    let dict = dictionary::dictionary_of(&plain)?;
    dictionary::recode_as(&plain, &dict, plain.data_type())
}

fn identifier_values(column: &Column, plain: &ArrayRef) -> Result<ArrayRef, TabularError> {
    match plain.data_type() {
        DataType::Int64 | DataType::Utf8 => Ok(plain.clone()),
        DataType::LargeUtf8 => Ok(cast(plain, &DataType::Utf8)?),
        DataType::Float16 | DataType::Float32 | DataType::Float64 => narrow_to_int64(column, plain),
        DataType::Null => Ok(Arc::new(Int64Array::new_null(plain.len()))),
        dt if dt.is_integer() || dt == &DataType::Boolean => Ok(strict_cast(column, plain, &DataType::Int64)?),
        other => Err(TabularError::conversion(
            &column.name,
            format!("cannot use {} values as identifiers", other),
        )),
    }
}

fn narrow_to_int64(column: &Column, array: &ArrayRef) -> Result<ArrayRef, TabularError> {
    let floats = cast(array, &DataType::Float64)?;
    let narrowed = floats
        .as_primitive::<Float64Type>()
        .iter()
        .map(|v| match v {
            None => Ok(None),
            Some(x) if x.is_nan() => Ok(None),
            Some(x) if x.is_finite() && x.fract() == 0.0 && x.abs() < i64::MAX as f64 => {
                Ok(Some(x as i64))
            }
            Some(x) => Err(TabularError::conversion(
                &column.name,
                format!("identifier {} is not an integer", x),
            )),
        })
        .collect::<Result<Int64Array, TabularError>>()?;
    Ok(Arc::new(narrowed))
}

/// Identifiers as `Float64`, the flat file and archive representation.
pub fn to_identifier_float64(column: &Column, array: &ArrayRef) -> Result<ArrayRef, TabularError> {
    strict_cast(column, &dictionary::decode(array)?, &DataType::Float64)
}

/// Identifiers as `Int64`, the relational representation.
pub fn to_identifier_int64(column: &Column, array: &ArrayRef) -> Result<ArrayRef, TabularError> {
    let plain = dictionary::decode(array)?;
    match plain.data_type() {
        DataType::Float16 | DataType::Float32 | DataType::Float64 => narrow_to_int64(column, &plain),
        _ => strict_cast(column, &plain, &DataType::Int64),
    }
}

/// Categorical codes as `Int64`; plain input is coded in first-seen order.
pub fn to_category_codes(column: &Column, array: &ArrayRef) -> Result<ArrayRef, TabularError> {
    let coded = if is_int32_dictionary(array.data_type()) {
        array.clone()
    } else {
        to_categorical(column, array)?
    };
    Ok(cast(as_int32_dictionary(&coded)?.keys(), &DataType::Int64)?)
}

//==================================================================================
// III. Temporal columns
//==================================================================================

fn nanos_per(unit: &TimeUnit) -> i64 {
    match unit {
        TimeUnit::Second => 1_000_000_000,
        TimeUnit::Millisecond => 1_000_000,
        TimeUnit::Microsecond => 1_000,
        TimeUnit::Nanosecond => 1,
    }
}

fn reinterpret<T: ArrowPrimitiveType<Native = i64>>(array: &ArrayRef) -> Int64Array {
    let typed = array.as_primitive::<T>();
    Int64Array::new(typed.values().clone(), typed.nulls().cloned())
}

/// The raw `i64` payload and unit of a timestamp or duration array.
fn temporal_values(array: &ArrayRef) -> Option<(TimeUnit, Int64Array)> {
    let values = match array.data_type() {
        DataType::Timestamp(TimeUnit::Second, _) => reinterpret::<TimestampSecondType>(array),
        DataType::Timestamp(TimeUnit::Millisecond, _) => reinterpret::<TimestampMillisecondType>(array),
        DataType::Timestamp(TimeUnit::Microsecond, _) => reinterpret::<TimestampMicrosecondType>(array),
        DataType::Timestamp(TimeUnit::Nanosecond, _) => reinterpret::<TimestampNanosecondType>(array),
        DataType::Duration(TimeUnit::Second) => reinterpret::<DurationSecondType>(array),
        DataType::Duration(TimeUnit::Millisecond) => reinterpret::<DurationMillisecondType>(array),
        DataType::Duration(TimeUnit::Microsecond) => reinterpret::<DurationMicrosecondType>(array),
        DataType::Duration(TimeUnit::Nanosecond) => reinterpret::<DurationNanosecondType>(array),
        _ => return None,
    };
    match array.data_type() {
        DataType::Timestamp(unit, _) | DataType::Duration(unit) => Some((*unit, values)),
        _ => None,
    }
}

fn rescale(
    column: &Column,
    values: &Int64Array,
    from: TimeUnit,
    to: TimeUnit,
) -> Result<Int64Array, TabularError> {
    let (f, t) = (nanos_per(&from), nanos_per(&to));
    values
        .iter()
        .map(|v| match v {
            None => Ok(None),
            Some(v) if f >= t => v.checked_mul(f / t).map(Some).ok_or_else(|| {
                TabularError::conversion(&column.name, format!("{} {:?} overflows {:?}", v, from, to))
            }),
            Some(v) => Ok(Some(v.div_euclid(t / f))),
        })
        .collect()
}

fn float_to_unit(
    column: &Column,
    array: &ArrayRef,
    from: TimeUnit,
    to: TimeUnit,
) -> Result<Int64Array, TabularError> {
    let factor = nanos_per(&from) as f64 / nanos_per(&to) as f64;
    let floats = cast(array, &DataType::Float64)?;
    floats
        .as_primitive::<Float64Type>()
        .iter()
        .map(|v| match v {
            None => Ok(None),
            Some(x) if x.is_nan() => Ok(None),
            Some(x) => {
                let scaled = (x * factor).round();
                if scaled.is_finite() && scaled.abs() < i64::MAX as f64 {
                    Ok(Some(scaled as i64))
                } else {
                    Err(TabularError::conversion(&column.name, format!("{} is out of range", x)))
                }
            }
        })
        .collect()
}

fn timestamp_array(values: Int64Array, unit: TimeUnit) -> ArrayRef {
    let (buffer, nulls) = (values.values().clone(), values.nulls().cloned());
    match unit {
        TimeUnit::Second => Arc::new(TimestampSecondArray::new(buffer, nulls)),
        TimeUnit::Millisecond => Arc::new(TimestampMillisecondArray::new(buffer, nulls)),
        TimeUnit::Microsecond => Arc::new(TimestampMicrosecondArray::new(buffer, nulls)),
        TimeUnit::Nanosecond => Arc::new(TimestampNanosecondArray::new(buffer, nulls)),
    }
}

fn duration_array(values: Int64Array, unit: TimeUnit) -> ArrayRef {
    let (buffer, nulls) = (values.values().clone(), values.nulls().cloned());
    match unit {
        TimeUnit::Second => Arc::new(DurationSecondArray::new(buffer, nulls)),
        TimeUnit::Millisecond => Arc::new(DurationMillisecondArray::new(buffer, nulls)),
        TimeUnit::Microsecond => Arc::new(DurationMicrosecondArray::new(buffer, nulls)),
        TimeUnit::Nanosecond => Arc::new(DurationNanosecondArray::new(buffer, nulls)),
    }
}

/// Parses the datetime text forms accepted on input: the flat file format
/// (with or without fractional seconds, space or `T` separated), RFC 3339 and
/// bare dates.
pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    for format in [FLAT_FILE_DATETIME_FORMAT, "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Some(parsed);
        }
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.naive_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Parses text datetimes into `unit` ticks since the epoch. Unparseable text
/// becomes missing.
fn parse_text_timestamps(
    column: &Column,
    array: &ArrayRef,
    unit: TimeUnit,
) -> Result<Int64Array, TabularError> {
    let text = cast(array, &DataType::Utf8)?;
    let mut failures = 0usize;
    let mut first_failure = None;
    let values: Int64Array = text
        .as_string::<i32>()
        .iter()
        .map(|v| {
            let v = v.filter(|s| !s.trim().is_empty())?;
            let parsed = parse_datetime(v).and_then(|dt| {
                let utc = dt.and_utc();
                match unit {
                    TimeUnit::Second => Some(utc.timestamp()),
                    TimeUnit::Millisecond => Some(utc.timestamp_millis()),
                    TimeUnit::Microsecond => Some(utc.timestamp_micros()),
                    TimeUnit::Nanosecond => utc.timestamp_nanos_opt(),
                }
            });
            if parsed.is_none() {
                failures += 1;
                first_failure.get_or_insert_with(|| v.to_string());
            }
            parsed
        })
        .collect();
    if let Some(example) = first_failure {
        log::warn!(
            "Column '{}': {} value(s) could not be parsed as datetimes and were set to missing (e.g. '{}')",
            column.name,
            failures,
            example
        );
    }
    Ok(values)
}

/// Any temporal, numeric or text input to `Timestamp(unit, None)`. Integers
/// are taken as ticks of `unit`, except for millisecond (epoch) timestamps
/// whose numeric input is seconds since the epoch.
fn to_timestamp(column: &Column, array: &ArrayRef, unit: TimeUnit) -> Result<ArrayRef, TabularError> {
    let plain = dictionary::decode(array)?;
    let numbers_in = match unit {
        TimeUnit::Millisecond => TimeUnit::Second,
        other => other,
    };
    let values = match plain.data_type() {
        DataType::Timestamp(_, _) => {
            let (from, values) = temporal_values(&plain)
                .ok_or_else(|| TabularError::Internal("timestamp payload".into()))?;
            rescale(column, &values, from, unit)?
        }
        DataType::Date32 | DataType::Date64 => {
            let millis = cast(&plain, &DataType::Timestamp(TimeUnit::Millisecond, None))?;
            let values = reinterpret::<TimestampMillisecondType>(&millis);
            rescale(column, &values, TimeUnit::Millisecond, unit)?
        }
        DataType::Utf8 | DataType::LargeUtf8 => {
            parse_text_timestamps(column, &plain, unit)?
        }
        DataType::Float16 | DataType::Float32 | DataType::Float64 => {
            float_to_unit(column, &plain, numbers_in, unit)?
        }
        dt if dt.is_integer() => {
            let ints = strict_cast(column, &plain, &DataType::Int64)?;
            rescale(column, ints.as_primitive::<Int64Type>(), numbers_in, unit)?
        }
        DataType::Null => Int64Array::new_null(plain.len()),
        other => {
            return Err(TabularError::conversion(
                &column.name,
                format!("cannot convert {} to a timestamp", other),
            ))
        }
    };
    Ok(timestamp_array(values, unit))
}

pub fn to_timestamp_ns(column: &Column, array: &ArrayRef) -> Result<ArrayRef, TabularError> {
    to_timestamp(column, array, TimeUnit::Nanosecond)
}

pub fn to_timestamp_ms(column: &Column, array: &ArrayRef) -> Result<ArrayRef, TabularError> {
    to_timestamp(column, array, TimeUnit::Millisecond)
}

/// Datetimes as flat file text.
pub fn to_datetime_text(column: &Column, array: &ArrayRef) -> Result<ArrayRef, TabularError> {
    let plain = dictionary::decode(array)?;
    if matches!(plain.data_type(), DataType::Utf8) {
        return Ok(plain);
    }
    let nanos = to_timestamp_ns(column, &plain)?;
    let text: StringArray = nanos
        .as_primitive::<TimestampNanosecondType>()
        .iter()
        .map(|v| {
            v.and_then(timestamp_ns_to_datetime)
                .map(|dt| dt.format(FLAT_FILE_DATETIME_FORMAT).to_string())
        })
        .collect();
    Ok(Arc::new(text))
}

/// Any duration, numeric (nanoseconds) or integer text input to `Duration(ns)`.
pub fn to_duration_ns(column: &Column, array: &ArrayRef) -> Result<ArrayRef, TabularError> {
    let plain = dictionary::decode(array)?;
    let values = match plain.data_type() {
        DataType::Duration(_) => {
            let (from, values) = temporal_values(&plain)
                .ok_or_else(|| TabularError::Internal("duration payload".into()))?;
            rescale(column, &values, from, TimeUnit::Nanosecond)?
        }
        DataType::Float16 | DataType::Float32 | DataType::Float64 => {
            float_to_unit(column, &plain, TimeUnit::Nanosecond, TimeUnit::Nanosecond)?
        }
        dt if dt.is_integer() || matches!(dt, DataType::Utf8 | DataType::LargeUtf8) => {
            let ints = strict_cast(column, &plain, &DataType::Int64)?;
            ints.as_primitive::<Int64Type>().clone()
        }
        DataType::Null => Int64Array::new_null(plain.len()),
        other => {
            return Err(TabularError::conversion(
                &column.name,
                format!("cannot convert {} to a duration", other),
            ))
        }
    };
    Ok(duration_array(values, TimeUnit::Nanosecond))
}

/// Durations as `Int64` nanoseconds.
pub fn to_duration_int64(column: &Column, array: &ArrayRef) -> Result<ArrayRef, TabularError> {
    let durations = to_duration_ns(column, array)?;
    Ok(Arc::new(reinterpret::<DurationNanosecondType>(&durations)))
}

/// Epoch datetimes as `Float64` seconds since the epoch.
pub fn to_epoch_seconds(column: &Column, array: &ArrayRef) -> Result<ArrayRef, TabularError> {
    let plain = dictionary::decode(array)?;
    if plain.data_type().is_numeric() {
        return strict_cast(column, &plain, &DataType::Float64);
    }
    let millis = to_timestamp_ms(column, &plain)?;
    let seconds: Float64Array = millis
        .as_primitive::<TimestampMillisecondType>()
        .iter()
        .map(|v| v.map(|ms| ms as f64 / 1_000.0))
        .collect();
    Ok(Arc::new(seconds))
}

//==================================================================================
// IV. Scalars
//==================================================================================

fn strict_cast(column: &Column, array: &ArrayRef, to: &DataType) -> Result<ArrayRef, TabularError> {
    let options = CastOptions {
        safe: false,
        ..Default::default()
    };
    cast_with_options(array, to, &options)
        .map_err(|e| TabularError::conversion(&column.name, e.to_string()))
}

pub fn to_float64(column: &Column, array: &ArrayRef) -> Result<ArrayRef, TabularError> {
    strict_cast(column, &dictionary::decode(array)?, &DataType::Float64)
}

/// Strict boolean conversion: only 0, 1, true, false (any case) or missing.
pub fn to_boolean(column: &Column, array: &ArrayRef) -> Result<ArrayRef, TabularError> {
    let plain = dictionary::decode(array)?;
    let invalid = |value: String| TabularError::InvalidBooleanValue {
        column: column.name.clone(),
        value,
    };
    let out: BooleanArray = match plain.data_type() {
        DataType::Boolean => return Ok(plain),
        DataType::Null => BooleanArray::new_null(plain.len()),
        DataType::Utf8 | DataType::LargeUtf8 => {
            let text = cast(&plain, &DataType::Utf8)?;
            text.as_string::<i32>()
                .iter()
                .map(|v| match v {
                    None => Ok(None),
                    Some(s) => match s.trim().to_ascii_lowercase().as_str() {
                        "" => Ok(None),
                        "0" | "false" => Ok(Some(false)),
                        "1" | "true" => Ok(Some(true)),
                        _ => Err(invalid(format!("'{}'", s))),
                    },
                })
                .collect::<Result<_, _>>()?
        }
        dt if dt.is_numeric() => {
            let floats = cast(&plain, &DataType::Float64)?;
            floats
                .as_primitive::<Float64Type>()
                .iter()
                .map(|v| match v {
                    None => Ok(None),
                    Some(x) if x.is_nan() => Ok(None),
                    Some(x) if x == 0.0 => Ok(Some(false)),
                    Some(x) if x == 1.0 => Ok(Some(true)),
                    Some(x) => Err(invalid(x.to_string())),
                })
                .collect::<Result<_, _>>()?
        }
        other => {
            return Err(TabularError::conversion(
                &column.name,
                format!("cannot convert {} to boolean", other),
            ))
        }
    };
    Ok(Arc::new(out))
}

/// Any input as `Utf8` text.
pub fn to_text(_column: &Column, array: &ArrayRef) -> Result<ArrayRef, TabularError> {
    let plain = dictionary::decode(array)?;
    match plain.data_type() {
        DataType::Utf8 => Ok(plain),
        dt if arrow::compute::can_cast_types(dt, &DataType::Utf8) => {
            Ok(cast(&plain, &DataType::Utf8)?)
        }
        _ => {
            let formatter = ArrayFormatter::try_new(plain.as_ref(), &FormatOptions::default())?;
            let text: StringArray = (0..plain.len())
                .map(|i| plain.is_valid(i).then(|| formatter.value(i).to_string()))
                .collect();
            Ok(Arc::new(text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TypeRegistry;

    fn col(semantic_type: SemanticType) -> Column {
        Column::new("c", semantic_type)
    }

    #[test]
    fn every_builtin_target_is_complete() {
        let registry = TypeRegistry::standard();
        for target in [
            StorageTarget::Default,
            StorageTarget::FlatFile,
            StorageTarget::ColumnarArchive,
            StorageTarget::ColumnarArchiveEncoded,
            StorageTarget::Relational,
            StorageTarget::RelationalEncoded,
        ] {
            assert!(registry.supports(&target), "{} is incomplete", target);
        }
    }

    #[test]
    fn relational_ddl() {
        let registry = TypeRegistry::standard();
        let ddl = |t, target: &StorageTarget| registry.metadata(&col(t), target).unwrap().ddl;
        assert_eq!(ddl(SemanticType::Categorical, &StorageTarget::Relational).as_deref(), Some("VARCHAR(255)"));
        assert_eq!(ddl(SemanticType::Categorical, &StorageTarget::RelationalEncoded).as_deref(), Some("INT"));
        assert_eq!(ddl(SemanticType::Numeric, &StorageTarget::Relational).as_deref(), Some("DOUBLE PRECISION"));
        assert_eq!(ddl(SemanticType::Numeric, &StorageTarget::FlatFile), None);
    }

    #[test]
    fn boolean_is_strict() {
        let ok: ArrayRef = Arc::new(Float64Array::from(vec![Some(0.0), None, Some(1.0)]));
        let out = to_boolean(&col(SemanticType::Boolean), &ok).unwrap();
        let out: Vec<_> = out.as_boolean().iter().collect();
        assert_eq!(out, vec![Some(false), None, Some(true)]);

        let text: ArrayRef = Arc::new(StringArray::from(vec!["TRUE", "0", "false"]));
        assert!(to_boolean(&col(SemanticType::Boolean), &text).is_ok());

        let bad: ArrayRef = Arc::new(Int64Array::from(vec![0, 2]));
        let err = to_boolean(&col(SemanticType::Boolean), &bad).unwrap_err();
        assert!(matches!(err, TabularError::InvalidBooleanValue { .. }));
    }

    #[test]
    fn datetime_text_round_trip() {
        let text: ArrayRef = Arc::new(StringArray::from(vec![
            Some("2021-03-04 05:06:07"),
            None,
            Some("2021-03-04T05:06:07.250Z"),
            Some("2021-03-04"),
        ]));
        let column = col(SemanticType::Datetime);
        let nanos = to_timestamp_ns(&column, &text).unwrap();
        assert_eq!(nanos.null_count(), 1);
        let back = to_datetime_text(&column, &nanos).unwrap();
        let back: Vec<_> = back.as_string::<i32>().iter().collect();
        assert_eq!(
            back,
            vec![
                Some("2021-03-04 05:06:07"),
                None,
                Some("2021-03-04 05:06:07.250"),
                Some("2021-03-04 00:00:00"),
            ]
        );
    }

    #[test]
    fn unparseable_datetimes_become_missing() {
        let text: ArrayRef = Arc::new(StringArray::from(vec!["not a date", "2020-01-01 00:00:00"]));
        let nanos = to_timestamp_ns(&col(SemanticType::Datetime), &text).unwrap();
        assert!(nanos.is_null(0));
        assert!(nanos.is_valid(1));
    }

    #[test]
    fn identifiers_narrow_from_floats() {
        let column = col(SemanticType::Identifier);
        let floats: ArrayRef = Arc::new(Float64Array::from(vec![Some(3.0), None, Some(3.0), Some(9.0)]));
        let coded = to_identifier(&column, &floats).unwrap();
        assert_eq!(coded.data_type(), &dictionary_type(DataType::Int64));
        let decoded = dictionary::decode(&coded).unwrap();
        let values: Vec<_> = decoded.as_primitive::<Int64Type>().iter().collect();
        assert_eq!(values, vec![Some(3), None, Some(3), Some(9)]);

        let fractional: ArrayRef = Arc::new(Float64Array::from(vec![1.5]));
        assert!(matches!(
            to_identifier(&column, &fractional),
            Err(TabularError::Conversion { .. })
        ));
    }

    #[test]
    fn epoch_datetime_seconds_and_back() {
        let column = col(SemanticType::EpochDatetime);
        let seconds: ArrayRef = Arc::new(Float64Array::from(vec![Some(1.5), None, Some(-86_400.0)]));
        let millis = to_timestamp_ms(&column, &seconds).unwrap();
        let raw: Vec<_> = millis.as_primitive::<TimestampMillisecondType>().iter().collect();
        assert_eq!(raw, vec![Some(1_500), None, Some(-86_400_000)]);
        let back = to_epoch_seconds(&column, &millis).unwrap();
        assert_eq!(back.as_primitive::<Float64Type>().value(0), 1.5);
    }

    #[test]
    fn durations_rescale() {
        let column = col(SemanticType::Duration);
        let secs: ArrayRef = Arc::new(DurationSecondArray::from(vec![Some(2), None]));
        let nanos = to_duration_int64(&column, &secs).unwrap();
        let values: Vec<_> = nanos.as_primitive::<Int64Type>().iter().collect();
        assert_eq!(values, vec![Some(2_000_000_000), None]);
    }

    #[test]
    fn category_codes_follow_dictionary() {
        let column = col(SemanticType::Categorical);
        let text: ArrayRef = Arc::new(StringArray::from(vec![Some("b"), Some("a"), None, Some("b")]));
        let codes = to_category_codes(&column, &text).unwrap();
        let codes: Vec<_> = codes.as_primitive::<Int64Type>().iter().collect();
        assert_eq!(codes, vec![Some(0), Some(1), None, Some(0)]);
    }

    #[test]
    fn numeric_text_is_not_lossy() {
        let text: ArrayRef = Arc::new(StringArray::from(vec!["1.5", "abc"]));
        assert!(matches!(
            to_float64(&col(SemanticType::Numeric), &text),
            Err(TabularError::Conversion { .. })
        ));
    }
}
