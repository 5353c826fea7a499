//! Category dictionaries for Categorical and Identifier columns.
//!
//! In memory a dictionary-coded column is an Arrow `DictionaryArray<Int32Type>`:
//! the values array is the category dictionary and the nullable `Int32` keys are
//! the codes. A null key is the "no category" sentinel. A dictionary only ever
//! grows at its end, so once a code is handed out it keeps its meaning.
//!
//! Everything that has to agree on codes (merge, update, append, joins) goes
//! through the helpers in this module.

use std::fmt;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, DictionaryArray, Int32Array, Int64Array, StringArray,
};
use arrow::compute::{cast, take};
use arrow::datatypes::{DataType, Int32Type, Int64Type};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::error::TabularError;

/// One distinct category: text or a 64-bit integer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(untagged)]
pub enum CategoryValue {
    Int(i64),
    Str(String),
}

impl fmt::Display for CategoryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CategoryValue::Int(v) => write!(f, "{}", v),
            CategoryValue::Str(s) => write!(f, "{}", s),
        }
    }
}

/// An ordered, append-only set of category values. The position of a value is
/// its code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryDictionary {
    values: Vec<CategoryValue>,
    lookup: HashMap<CategoryValue, i32>,
}

impl CategoryDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a dictionary from values in code order. Duplicates are rejected.
    pub fn from_values(values: Vec<CategoryValue>) -> Result<Self, TabularError> {
        let mut dict = Self::new();
        for value in values {
            if dict.lookup.contains_key(&value) {
                return Err(TabularError::InvalidArgument(format!(
                    "category '{}' appears twice in dictionary",
                    value
                )));
            }
            dict.insert(value)?;
        }
        Ok(dict)
    }

    /// Reads the values array of an Arrow dictionary.
    pub fn from_array(values: &ArrayRef) -> Result<Self, TabularError> {
        let mut dict = Self::new();
        for row in 0..values.len() {
            if let Some(value) = value_at(values, row)? {
                dict.insert(value)?;
            }
        }
        Ok(dict)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[CategoryValue] {
        &self.values
    }

    pub fn code_of(&self, value: &CategoryValue) -> Option<i32> {
        self.lookup.get(value).copied()
    }

    pub fn get(&self, code: i32) -> Option<&CategoryValue> {
        usize::try_from(code).ok().and_then(|i| self.values.get(i))
    }

    /// Returns the code of `value`, appending it if unseen.
    pub fn insert(&mut self, value: CategoryValue) -> Result<i32, TabularError> {
        if let Some(code) = self.lookup.get(&value) {
            return Ok(*code);
        }
        let code = i32::try_from(self.values.len()).map_err(|_| {
            TabularError::InvalidArgument("category dictionary exceeds i32 codes".into())
        })?;
        self.lookup.insert(value.clone(), code);
        self.values.push(value);
        Ok(code)
    }

    /// Appends every unseen value of `values` in first-seen order and returns
    /// the ones that were added.
    pub fn extend<I>(&mut self, values: I) -> Result<Vec<CategoryValue>, TabularError>
    where
        I: IntoIterator<Item = CategoryValue>,
    {
        let mut added = Vec::new();
        for value in values {
            if !self.lookup.contains_key(&value) {
                self.insert(value.clone())?;
                added.push(value);
            }
        }
        Ok(added)
    }

    /// `Int64` when every value is an integer, `Utf8` otherwise.
    pub fn value_type(&self) -> DataType {
        if !self.values.is_empty()
            && self
                .values
                .iter()
                .all(|v| matches!(v, CategoryValue::Int(_)))
        {
            DataType::Int64
        } else {
            DataType::Utf8
        }
    }

    /// The dictionary as an Arrow values array, in code order.
    pub fn to_array(&self) -> ArrayRef {
        self.to_array_of(&self.value_type())
    }

    /// The dictionary as an Arrow values array of the requested type; integer
    /// values are rendered as text when `Utf8` is requested.
    pub fn to_array_of(&self, value_type: &DataType) -> ArrayRef {
        match value_type {
            DataType::Int64 => Arc::new(
                self.values
                    .iter()
                    .map(|v| match v {
                        CategoryValue::Int(i) => Some(*i),
                        CategoryValue::Str(s) => s.parse::<i64>().ok(),
                    })
                    .collect::<Int64Array>(),
            ),
            _ => Arc::new(
                self.values
                    .iter()
                    .map(|v| Some(v.to_string()))
                    .collect::<StringArray>(),
            ),
        }
    }
}

/// The logical value at `row` of a plain or dictionary-coded array.
pub fn value_at(array: &ArrayRef, row: usize) -> Result<Option<CategoryValue>, TabularError> {
    if array.is_null(row) {
        return Ok(None);
    }
    let value = match array.data_type() {
        DataType::Dictionary(_, value_type) if !is_int32_dictionary(array.data_type()) => {
            let plain = cast(&array.slice(row, 1), value_type)?;
            return value_at(&plain, 0);
        }
        DataType::Dictionary(_, _) => {
            let dict = as_int32_dictionary(array)?;
            let key = dict.keys().value(row);
            let values = dict.values();
            let index = usize::try_from(key)
                .map_err(|_| TabularError::Internal(format!("negative dictionary key {}", key)))?;
            return value_at(values, index);
        }
        DataType::Utf8 => CategoryValue::Str(array.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => CategoryValue::Str(array.as_string::<i64>().value(row).to_string()),
        DataType::Int64 => CategoryValue::Int(array.as_primitive::<Int64Type>().value(row)),
        dt if dt.is_integer() => {
            let wide = cast(&array.slice(row, 1), &DataType::Int64)?;
            CategoryValue::Int(wide.as_primitive::<Int64Type>().value(0))
        }
        _ => {
            let text = cast(&array.slice(row, 1), &DataType::Utf8)?;
            CategoryValue::Str(text.as_string::<i32>().value(0).to_string())
        }
    };
    Ok(Some(value))
}

/// Views `array` as an `Int32`-keyed dictionary.
pub fn as_int32_dictionary(array: &ArrayRef) -> Result<&DictionaryArray<Int32Type>, TabularError> {
    array
        .as_any()
        .downcast_ref::<DictionaryArray<Int32Type>>()
        .ok_or_else(|| {
            TabularError::Internal(format!(
                "expected Dictionary(Int32, _) array, found {}",
                array.data_type()
            ))
        })
}

/// Returns `true` for `Dictionary(Int32, _)` columns.
pub fn is_int32_dictionary(data_type: &DataType) -> bool {
    matches!(data_type, DataType::Dictionary(key, _) if key.as_ref() == &DataType::Int32)
}

/// Reads the dictionary of a coded array, or builds one in first-seen order
/// from the rows of a plain array.
pub fn dictionary_of(array: &ArrayRef) -> Result<CategoryDictionary, TabularError> {
    if is_int32_dictionary(array.data_type()) {
        CategoryDictionary::from_array(as_int32_dictionary(array)?.values())
    } else {
        let mut dict = CategoryDictionary::new();
        extend_from(&mut dict, array)?;
        Ok(dict)
    }
}

/// Adds the values of `array` to `dict`. For coded arrays the dictionary
/// values are taken in their code order; for plain arrays in row order.
pub fn extend_from(
    dict: &mut CategoryDictionary,
    array: &ArrayRef,
) -> Result<Vec<CategoryValue>, TabularError> {
    let source: &ArrayRef = if is_int32_dictionary(array.data_type()) {
        as_int32_dictionary(array)?.values()
    } else {
        array
    };
    let mut added = Vec::new();
    for row in 0..source.len() {
        if let Some(value) = value_at(source, row)? {
            if dict.code_of(&value).is_none() {
                dict.insert(value.clone())?;
                added.push(value);
            }
        }
    }
    Ok(added)
}

/// Adds the values that occur in the rows of `array`, in row order. Unlike
/// [`extend_from`], unused entries of a coded array's dictionary are skipped.
pub fn extend_from_rows(
    dict: &mut CategoryDictionary,
    array: &ArrayRef,
) -> Result<Vec<CategoryValue>, TabularError> {
    let mut added = Vec::new();
    let mut admit = |dict: &mut CategoryDictionary, value: Option<CategoryValue>| {
        if let Some(value) = value {
            if dict.code_of(&value).is_none() {
                dict.insert(value.clone())?;
                added.push(value);
            }
        }
        Ok::<(), TabularError>(())
    };

    if is_int32_dictionary(array.data_type()) {
        let coded = as_int32_dictionary(array)?;
        let values = coded.values();
        let mut seen = vec![false; values.len()];
        for key in coded.keys().iter().flatten() {
            let index = usize::try_from(key)
                .map_err(|_| TabularError::Internal(format!("negative dictionary key {}", key)))?;
            match seen.get_mut(index) {
                Some(true) => continue,
                Some(slot) => *slot = true,
                None => {
                    return Err(TabularError::Internal(format!(
                        "dictionary key {} out of range",
                        key
                    )))
                }
            }
            admit(dict, value_at(values, index)?)?;
        }
    } else {
        for row in 0..array.len() {
            admit(dict, value_at(array, row)?)?;
        }
    }
    Ok(added)
}

/// Union of the dictionaries of several arrays: the first array's values
/// first, then unseen values of later arrays in first-seen order.
pub fn union(arrays: &[&ArrayRef]) -> Result<CategoryDictionary, TabularError> {
    let mut dict = CategoryDictionary::new();
    for array in arrays {
        extend_from(&mut dict, array)?;
    }
    Ok(dict)
}

/// Codes of every row of `array` against `dict`. Values missing from `dict`
/// are an `Internal` error; callers extend the dictionary first.
pub fn encode_keys(array: &ArrayRef, dict: &CategoryDictionary) -> Result<Int32Array, TabularError> {
    if is_int32_dictionary(array.data_type()) {
        let coded = as_int32_dictionary(array)?;
        // Remap through the small values array rather than row by row.
        let values = coded.values();
        let mut remap = Vec::with_capacity(values.len());
        for i in 0..values.len() {
            remap.push(match value_at(values, i)? {
                Some(v) => Some(lookup(dict, &v)?),
                None => None,
            });
        }
        return Ok(coded
            .keys()
            .iter()
            .map(|key| key.and_then(|k| remap.get(k as usize).copied().flatten()))
            .collect());
    }
    let mut keys = Vec::with_capacity(array.len());
    for row in 0..array.len() {
        keys.push(match value_at(array, row)? {
            Some(v) => Some(lookup(dict, &v)?),
            None => None,
        });
    }
    Ok(Int32Array::from(keys))
}

fn lookup(dict: &CategoryDictionary, value: &CategoryValue) -> Result<i32, TabularError> {
    dict.code_of(value).ok_or_else(|| {
        TabularError::Internal(format!("category '{}' missing from dictionary", value))
    })
}

/// Re-encodes `array` against `dict`, producing a `Dictionary(Int32, _)` array
/// whose values are exactly `dict`.
pub fn recode(array: &ArrayRef, dict: &CategoryDictionary) -> Result<ArrayRef, TabularError> {
    recode_as(array, dict, &dict.value_type())
}

/// Like [`recode`] with an explicit value type for the dictionary values.
pub fn recode_as(
    array: &ArrayRef,
    dict: &CategoryDictionary,
    value_type: &DataType,
) -> Result<ArrayRef, TabularError> {
    let keys = encode_keys(array, dict)?;
    build(keys, dict.to_array_of(value_type))
}

/// Encodes a plain array in first-seen order.
pub fn encode(array: &ArrayRef) -> Result<ArrayRef, TabularError> {
    let dict = dictionary_of(array)?;
    recode(array, &dict)
}

pub(crate) fn build(keys: Int32Array, values: ArrayRef) -> Result<ArrayRef, TabularError> {
    Ok(Arc::new(DictionaryArray::<Int32Type>::try_new(keys, values)?))
}

/// Expands a coded array to its plain values.
pub fn decode(array: &ArrayRef) -> Result<ArrayRef, TabularError> {
    match array.data_type() {
        dt if is_int32_dictionary(dt) => {
            let coded = as_int32_dictionary(array)?;
            Ok(take(coded.values().as_ref(), coded.keys(), None)?)
        }
        DataType::Dictionary(_, value_type) => Ok(cast(array, value_type)?),
        _ => Ok(array.clone()),
    }
}

/// Concatenates dictionary arrays that share one dictionary by concatenating
/// their keys.
pub(crate) fn concat_coded(
    arrays: &[ArrayRef],
    dict: &CategoryDictionary,
    value_type: &DataType,
) -> Result<ArrayRef, TabularError> {
    let mut keys: Vec<Option<i32>> = Vec::with_capacity(arrays.iter().map(|a| a.len()).sum());
    for array in arrays {
        keys.extend(encode_keys(array, dict)?.iter());
    }
    build(Int32Array::from(keys), dict.to_array_of(value_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[Option<&str>]) -> ArrayRef {
        Arc::new(values.iter().copied().collect::<StringArray>())
    }

    #[test]
    fn first_seen_order_and_null_sentinel() {
        let coded = encode(&strings(&[Some("b"), None, Some("a"), Some("b")])).unwrap();
        let dict = as_int32_dictionary(&coded).unwrap();
        let keys: Vec<_> = dict.keys().iter().collect();
        assert_eq!(keys, vec![Some(0), None, Some(1), Some(0)]);
        assert_eq!(dict.values().as_string::<i32>().value(1), "a");
    }

    #[test]
    fn union_keeps_existing_codes() {
        let old = encode(&strings(&[Some("x"), Some("y")])).unwrap();
        let new = strings(&[Some("z"), Some("y"), Some("w")]);
        let dict = union(&[&old, &new]).unwrap();
        assert_eq!(
            dict.values(),
            &[
                CategoryValue::Str("x".into()),
                CategoryValue::Str("y".into()),
                CategoryValue::Str("z".into()),
                CategoryValue::Str("w".into()),
            ]
        );
        let recoded = recode(&new, &dict).unwrap();
        let keys: Vec<_> = as_int32_dictionary(&recoded).unwrap().keys().iter().collect();
        assert_eq!(keys, vec![Some(2), Some(1), Some(3)]);
    }

    #[test]
    fn integer_dictionaries_stay_integer() {
        let ids: ArrayRef = Arc::new(Int64Array::from(vec![Some(7), Some(3), Some(7)]));
        let dict = dictionary_of(&ids).unwrap();
        assert_eq!(dict.value_type(), DataType::Int64);
        let decoded = decode(&recode(&ids, &dict).unwrap()).unwrap();
        assert_eq!(decoded.as_ref(), ids.as_ref());
    }

    #[test]
    fn sidecar_line_encoding() {
        let line = serde_json::to_string(&CategoryValue::Str("a\nb".into())).unwrap();
        assert_eq!(line, "\"a\\nb\"");
        let back: CategoryValue = serde_json::from_str("42").unwrap();
        assert_eq!(back, CategoryValue::Int(42));
    }

    #[test]
    fn rejects_duplicate_values() {
        let err = CategoryDictionary::from_values(vec![
            CategoryValue::Int(1),
            CategoryValue::Int(1),
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn extend_from_rows_skips_unused_entries() {
        let keys = Int32Array::from(vec![Some(2), None, Some(0), Some(2)]);
        let coded = build(keys, strings(&[Some("a"), Some("unused"), Some("c")])).unwrap();
        let mut dict = CategoryDictionary::from_values(vec![CategoryValue::Str("a".into())]).unwrap();
        let added = extend_from_rows(&mut dict, &coded).unwrap();
        assert_eq!(added, vec![CategoryValue::Str("c".into())]);
        assert_eq!(dict.len(), 2);
    }
}
