//! Change-tracking attribute value container.
//!
//! A [`ValueList`] is an ordered set of [`AttrValue`]s that keeps the values
//! unique (text compared case-insensitively, bytes literally) and records
//! which values were added or deleted since it was loaded, so that an entry
//! can later derive the minimal LDAP modify request.

use std::fmt;
use std::ops::{Add, AddAssign, Range};

use tracing::warn;

use crate::error::{LdapError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttrValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl AttrValue {
    /// Decode a value received from the server; `raw` attributes stay bytes.
    pub fn from_server(bytes: Vec<u8>, raw: bool) -> Self {
        if raw {
            return AttrValue::Bytes(bytes);
        }
        match String::from_utf8(bytes) {
            Ok(text) => AttrValue::Text(text),
            Err(err) => AttrValue::Bytes(err.into_bytes()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AttrValue::Text(s) => s.as_bytes(),
            AttrValue::Bytes(b) => b,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            AttrValue::Bytes(_) => None,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            AttrValue::Text(s) => s.into_bytes(),
            AttrValue::Bytes(b) => b,
        }
    }

    /// Uniqueness test: case-insensitive for text, literal otherwise.
    pub fn same_value(&self, other: &AttrValue) -> bool {
        match (self, other) {
            (AttrValue::Text(a), AttrValue::Text(b)) => a == b || a.to_lowercase() == b.to_lowercase(),
            _ => self.as_bytes() == other.as_bytes(),
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Text(s) => f.write_str(s),
            AttrValue::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

impl From<Vec<u8>> for AttrValue {
    fn from(value: Vec<u8>) -> Self {
        AttrValue::Bytes(value)
    }
}

impl From<&[u8]> for AttrValue {
    fn from(value: &[u8]) -> Self {
        AttrValue::Bytes(value.to_vec())
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<i32> for AttrValue {
    fn from(value: i32) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Text(if value { "TRUE" } else { "FALSE" }.to_string())
    }
}

/// 0 = unchanged, 1 = incrementally modified, 2 = replaced wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeStatus {
    #[default]
    Unchanged = 0,
    Modified = 1,
    Replaced = 2,
}

#[derive(Debug, Clone, Default)]
pub struct ValueList {
    values: Vec<AttrValue>,
    added: Vec<AttrValue>,
    deleted: Vec<AttrValue>,
    status: ChangeStatus,
}

fn position(list: &[AttrValue], value: &AttrValue) -> Option<usize> {
    list.iter().position(|v| v.same_value(value))
}

fn check_unique(values: &[AttrValue]) -> Result<()> {
    for (i, v) in values.iter().enumerate() {
        if position(&values[..i], v).is_some() {
            return Err(LdapError::InvalidArgument(format!("duplicate value {:?}", v.to_string())));
        }
    }
    Ok(())
}

impl ValueList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values as loaded from the server: present, with no pending changes.
    pub fn from_values<I, V>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<AttrValue>,
    {
        let values: Vec<AttrValue> = values.into_iter().map(Into::into).collect();
        check_unique(&values)?;
        Ok(Self {
            values,
            ..Self::default()
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AttrValue> {
        self.values.iter()
    }

    pub fn values(&self) -> &[AttrValue] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&AttrValue> {
        self.values.get(index)
    }

    pub fn contains<V: Into<AttrValue>>(&self, value: V) -> bool {
        position(&self.values, &value.into()).is_some()
    }

    pub fn added(&self) -> &[AttrValue] {
        &self.added
    }

    pub fn deleted(&self) -> &[AttrValue] {
        &self.deleted
    }

    pub fn status(&self) -> ChangeStatus {
        self.status
    }

    fn mark_modified(&mut self) {
        if self.status == ChangeStatus::Unchanged {
            self.status = ChangeStatus::Modified;
        }
    }

    /// Record `value` as newly present, balancing against `deleted`.
    fn track_added(&mut self, value: &AttrValue) {
        match position(&self.deleted, value) {
            Some(idx) => {
                self.deleted.remove(idx);
            }
            None => self.added.push(value.clone()),
        }
        self.mark_modified();
    }

    /// Record `value` as gone, balancing against `added`.
    fn track_removed(&mut self, value: &AttrValue) {
        match position(&self.added, value) {
            Some(idx) => {
                self.added.remove(idx);
            }
            None => self.deleted.push(value.clone()),
        }
        self.mark_modified();
    }

    pub fn append<V: Into<AttrValue>>(&mut self, value: V) -> Result<()> {
        let len = self.values.len();
        self.insert(len, value)
    }

    pub fn insert<V: Into<AttrValue>>(&mut self, index: usize, value: V) -> Result<()> {
        let value = value.into();
        if position(&self.values, &value).is_some() {
            return Err(LdapError::InvalidArgument(format!("{:?} is already in the list", value.to_string())));
        }
        self.track_added(&value);
        let index = index.min(self.values.len());
        self.values.insert(index, value);
        Ok(())
    }

    pub fn extend<I, V>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = V>,
        V: Into<AttrValue>,
    {
        let values: Vec<AttrValue> = values.into_iter().map(Into::into).collect();
        check_unique(&values)?;
        if let Some(dup) = values.iter().find(|v| position(&self.values, v).is_some()) {
            return Err(LdapError::InvalidArgument(format!("{:?} is already in the list", dup.to_string())));
        }
        for value in values {
            self.append(value)?;
        }
        Ok(())
    }

    pub fn remove<V: Into<AttrValue>>(&mut self, value: V) -> Result<()> {
        let value = value.into();
        let idx = position(&self.values, &value)
            .ok_or_else(|| LdapError::InvalidArgument(format!("{:?} is not in the list", value.to_string())))?;
        let removed = self.values.remove(idx);
        self.track_removed(&removed);
        Ok(())
    }

    /// Record deletions for values that may not have been loaded locally.
    pub fn delete_values<I, V>(&mut self, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<AttrValue>,
    {
        for value in values {
            let value = value.into();
            match position(&self.values, &value) {
                Some(idx) => {
                    let removed = self.values.remove(idx);
                    self.track_removed(&removed);
                }
                None if position(&self.deleted, &value).is_none() => {
                    self.deleted.push(value);
                    self.mark_modified();
                }
                None => {}
            }
        }
    }

    /// Remove and return the value at `index` (negative counts from the end), or the last value.
    pub fn pop(&mut self, index: Option<isize>) -> Result<AttrValue> {
        let len = self.values.len() as isize;
        let idx = index.unwrap_or(-1);
        let idx = if idx < 0 { len + idx } else { idx };
        if !(0..len).contains(&idx) {
            return Err(LdapError::InvalidArgument("pop index out of range".to_string()));
        }
        let removed = self.values.remove(idx as usize);
        self.track_removed(&removed);
        Ok(removed)
    }

    pub fn clear(&mut self) {
        for value in std::mem::take(&mut self.values) {
            self.track_removed(&value);
        }
    }

    /// Replace the value at `index`.
    pub fn set<V: Into<AttrValue>>(&mut self, index: usize, value: V) -> Result<()> {
        let value = value.into();
        if index >= self.values.len() {
            return Err(LdapError::InvalidArgument("index out of range".to_string()));
        }
        if let Some(existing) = position(&self.values, &value) {
            if existing != index {
                return Err(LdapError::InvalidArgument(format!("{:?} is already in the list", value.to_string())));
            }
        }
        let old = std::mem::replace(&mut self.values[index], value.clone());
        self.track_removed(&old);
        self.track_added(&value);
        Ok(())
    }

    /// Replace a range of values, like slice assignment.
    pub fn set_range<I, V>(&mut self, range: Range<usize>, values: I) -> Result<()>
    where
        I: IntoIterator<Item = V>,
        V: Into<AttrValue>,
    {
        let start = range.start.min(self.values.len());
        let end = range.end.clamp(start, self.values.len());
        let values: Vec<AttrValue> = values.into_iter().map(Into::into).collect();
        check_unique(&values)?;
        let outside = self.values[..start].iter().chain(self.values[end..].iter());
        for kept in outside {
            if position(&values, kept).is_some() {
                return Err(LdapError::InvalidArgument(format!("{:?} is already in the list", kept.to_string())));
            }
        }
        let removed: Vec<AttrValue> = self.values.splice(start..end, values.iter().cloned()).collect();
        for old in &removed {
            self.track_removed(old);
        }
        for new in &values {
            self.track_added(new);
        }
        Ok(())
    }

    pub fn remove_range(&mut self, range: Range<usize>) {
        let start = range.start.min(self.values.len());
        let end = range.end.clamp(start, self.values.len());
        let removed: Vec<AttrValue> = self.values.drain(start..end).collect();
        for old in &removed {
            self.track_removed(old);
        }
    }

    /// Wholesale replacement: every new value is recorded as added and `deleted` is cleared.
    pub fn replace<I, V>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = V>,
        V: Into<AttrValue>,
    {
        let values: Vec<AttrValue> = values.into_iter().map(Into::into).collect();
        check_unique(&values)?;
        self.added = values.clone();
        self.values = values;
        self.deleted.clear();
        self.status = ChangeStatus::Replaced;
        Ok(())
    }

    /// Forget pending changes, keeping the current values.
    pub fn clear_changes(&mut self) {
        self.added.clear();
        self.deleted.clear();
        self.status = ChangeStatus::Unchanged;
    }
}

impl<'a> IntoIterator for &'a ValueList {
    type Item = &'a AttrValue;
    type IntoIter = std::slice::Iter<'a, AttrValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

impl PartialEq for ValueList {
    fn eq(&self, other: &Self) -> bool {
        self.values.len() == other.values.len()
            && self.values.iter().zip(other.values.iter()).all(|(a, b)| a.same_value(b))
    }
}

impl<V> PartialEq<Vec<V>> for ValueList
where
    V: Into<AttrValue> + Clone,
{
    fn eq(&self, other: &Vec<V>) -> bool {
        self.values.len() == other.len()
            && self
                .values
                .iter()
                .zip(other.iter())
                .all(|(a, b)| a.same_value(&b.clone().into()))
    }
}

impl<V: Into<AttrValue>> Add<Vec<V>> for ValueList {
    type Output = Result<ValueList>;

    fn add(mut self, rhs: Vec<V>) -> Result<ValueList> {
        self.extend(rhs)?;
        Ok(self)
    }
}

impl Add<ValueList> for ValueList {
    type Output = Result<ValueList>;

    fn add(mut self, rhs: ValueList) -> Result<ValueList> {
        self.extend(rhs.values)?;
        Ok(self)
    }
}

/// `+=` cannot report a duplicate. The list is left untouched in that case;
/// call [`ValueList::extend`] to get the error.
impl<V: Into<AttrValue>> AddAssign<Vec<V>> for ValueList {
    fn add_assign(&mut self, rhs: Vec<V>) {
        if let Err(err) = self.extend(rhs) {
            warn!("Ignoring += on value list: {}", err);
        }
    }
}

impl AddAssign<ValueList> for ValueList {
    fn add_assign(&mut self, rhs: ValueList) {
        *self += rhs.values;
    }
}
