//! Directory entries with change tracking.
//!
//! Keys are attribute names compared case-insensitively; the first spelling
//! seen is kept. The pseudo-key `dn` addresses the entry's distinguished name.
//! Removing an attribute remembers its name so the next modify can delete it
//! on the server.

use crate::connection::Connection;
use crate::dn::DistinguishedName;
use crate::error::{LdapError, Result};
use crate::ldap_protocol::{Attribute, ModifyChange, ModifyOperation, SearchResultEntry};
use crate::value_list::{AttrValue, ChangeStatus, ValueList};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOp {
    Add,
    Delete,
    Replace,
}

/// Borrowed view of what a key resolves to.
#[derive(Debug, PartialEq)]
pub enum EntryItem<'a> {
    Dn(&'a DistinguishedName),
    Values(&'a ValueList),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entry {
    dn: DistinguishedName,
    attributes: Vec<(String, ValueList)>,
    deleted_keys: Vec<String>,
}

fn is_dn_key(key: &str) -> bool {
    key.eq_ignore_ascii_case("dn")
}

impl Entry {
    pub fn new(dn: &str) -> Result<Self> {
        Ok(Self::with_dn(DistinguishedName::parse(dn)?))
    }

    pub fn with_dn(dn: DistinguishedName) -> Self {
        Self {
            dn,
            attributes: Vec::new(),
            deleted_keys: Vec::new(),
        }
    }

    /// Build an entry from a search result; values of `raw_attributes` stay bytes.
    pub fn from_search_entry(entry: SearchResultEntry, raw_attributes: &[String]) -> Result<Self> {
        let dn = DistinguishedName::parse(&entry.object_name)?;
        let mut out = Self::with_dn(dn);
        for attr in entry.attributes {
            let raw = raw_attributes.iter().any(|r| r.eq_ignore_ascii_case(&attr.attr_type));
            let values: Vec<AttrValue> = attr
                .attr_values
                .into_iter()
                .map(|v| AttrValue::from_server(v, raw))
                .collect();
            // Servers do not send duplicates, but tolerate them rather than reject the entry.
            let mut list = ValueList::new();
            for value in values {
                if !list.contains(value.clone()) {
                    list.append(value)?;
                }
            }
            list.clear_changes();
            out.attributes.push((attr.attr_type, list));
        }
        Ok(out)
    }

    pub fn dn(&self) -> &DistinguishedName {
        &self.dn
    }

    pub fn set_dn(&mut self, dn: DistinguishedName) {
        self.dn = dn;
    }

    fn index_of(&self, key: &str) -> Option<usize> {
        self.attributes.iter().position(|(name, _)| name.eq_ignore_ascii_case(key))
    }

    pub fn get(&self, key: &str) -> Option<&ValueList> {
        self.index_of(key).map(|i| &self.attributes[i].1)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut ValueList> {
        self.index_of(key).map(move |i| &mut self.attributes[i].1)
    }

    /// Resolve a key, `dn` included.
    pub fn item(&self, key: &str) -> Option<EntryItem<'_>> {
        if is_dn_key(key) {
            return Some(EntryItem::Dn(&self.dn));
        }
        self.get(key).map(EntryItem::Values)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        is_dn_key(key) || self.index_of(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Attribute names, optionally preceded by `dn`.
    pub fn keys(&self, exclude_dn: bool) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.attributes.len() + 1);
        if !exclude_dn {
            keys.push("dn".to_string());
        }
        keys.extend(self.attributes.iter().map(|(name, _)| name.clone()));
        keys
    }

    pub fn items(&self, exclude_dn: bool) -> Vec<(String, EntryItem<'_>)> {
        let mut items = Vec::with_capacity(self.attributes.len() + 1);
        if !exclude_dn {
            items.push(("dn".to_string(), EntryItem::Dn(&self.dn)));
        }
        items.extend(self.attributes.iter().map(|(name, list)| (name.clone(), EntryItem::Values(list))));
        items
    }

    pub fn values(&self, exclude_dn: bool) -> Vec<EntryItem<'_>> {
        self.items(exclude_dn).into_iter().map(|(_, item)| item).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ValueList)> {
        self.attributes.iter().map(|(name, list)| (name.as_str(), list))
    }

    pub fn deleted_keys(&self) -> &[String] {
        &self.deleted_keys
    }

    /// Assign a key. For `dn` the value must be one valid DN string; attributes are replaced wholesale.
    pub fn set<I, V>(&mut self, key: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = V>,
        V: Into<AttrValue>,
    {
        if is_dn_key(key) {
            let mut values: Vec<AttrValue> = values.into_iter().map(Into::into).collect();
            let dn = match (values.pop(), values.is_empty()) {
                (Some(AttrValue::Text(text)), true) => DistinguishedName::parse(&text)?,
                _ => return Err(LdapError::InvalidArgument("dn must be set to a single string".to_string())),
            };
            self.dn = dn;
            return Ok(());
        }
        match self.index_of(key) {
            Some(i) => self.attributes[i].1.replace(values)?,
            None => {
                let mut list = ValueList::new();
                list.replace(values)?;
                self.attributes.push((key.to_string(), list));
            }
        }
        self.deleted_keys.retain(|k| !k.eq_ignore_ascii_case(key));
        Ok(())
    }

    /// Delete a whole attribute, remembering it for the next modify.
    pub fn remove(&mut self, key: &str) -> Result<ValueList> {
        if is_dn_key(key) {
            return Err(LdapError::InvalidArgument("the dn of an entry cannot be deleted".to_string()));
        }
        let i = self
            .index_of(key)
            .ok_or_else(|| LdapError::InvalidArgument(format!("no attribute {:?}", key)))?;
        let (name, list) = self.attributes.remove(i);
        if !self.deleted_keys.iter().any(|k| k.eq_ignore_ascii_case(&name)) {
            self.deleted_keys.push(name);
        }
        Ok(list)
    }

    /// Merge another set of attributes, replacing each listed one.
    pub fn update<K, I, V>(&mut self, other: impl IntoIterator<Item = (K, I)>) -> Result<()>
    where
        K: AsRef<str>,
        I: IntoIterator<Item = V>,
        V: Into<AttrValue>,
    {
        for (key, values) in other {
            self.set(key.as_ref(), values)?;
        }
        Ok(())
    }

    pub fn change_attribute<I, V>(&mut self, name: &str, op: ModifyOp, values: I) -> Result<()>
    where
        I: IntoIterator<Item = V>,
        V: Into<AttrValue>,
    {
        if is_dn_key(name) {
            return Err(LdapError::InvalidArgument("use rename to change the dn".to_string()));
        }
        let values: Vec<AttrValue> = values.into_iter().map(Into::into).collect();
        match op {
            ModifyOp::Add => {
                let list = self.list_for_change(name);
                list.extend(values)?;
            }
            ModifyOp::Delete if values.is_empty() => {
                if self.index_of(name).is_some() {
                    self.remove(name)?;
                } else if !self.deleted_keys.iter().any(|k| k.eq_ignore_ascii_case(name)) {
                    self.deleted_keys.push(name.to_string());
                }
            }
            ModifyOp::Delete => {
                let list = self.list_for_change(name);
                list.delete_values(values);
            }
            ModifyOp::Replace => {
                self.list_for_change(name).replace(values)?;
            }
        }
        Ok(())
    }

    fn list_for_change(&mut self, name: &str) -> &mut ValueList {
        self.deleted_keys.retain(|k| !k.eq_ignore_ascii_case(name));
        let i = match self.index_of(name) {
            Some(i) => i,
            None => {
                self.attributes.push((name.to_string(), ValueList::new()));
                self.attributes.len() - 1
            }
        };
        &mut self.attributes[i].1
    }

    pub fn clear_attribute_changes(&mut self, name: &str) {
        if let Some(list) = self.get_mut(name) {
            list.clear_changes();
        }
    }

    /// Reset every change marker once the server has accepted the changes.
    pub fn clear_changes(&mut self) {
        for (_, list) in &mut self.attributes {
            list.clear_changes();
        }
        self.deleted_keys.clear();
    }

    /// Modify items in attribute order, then the deleted attributes.
    pub fn modify_changes(&self) -> Vec<ModifyChange> {
        let mut changes = Vec::new();
        for (name, list) in &self.attributes {
            match list.status() {
                ChangeStatus::Unchanged => {}
                ChangeStatus::Modified => {
                    if !list.added().is_empty() {
                        changes.push(change(ModifyOperation::Add, name, list.added()));
                    }
                    if !list.deleted().is_empty() {
                        changes.push(change(ModifyOperation::Delete, name, list.deleted()));
                    }
                }
                ChangeStatus::Replaced => changes.push(change(ModifyOperation::Replace, name, list.values())),
            }
        }
        for name in &self.deleted_keys {
            changes.push(change(ModifyOperation::Delete, name, &[]));
        }
        changes
    }

    /// Attributes for an add request (attributes without values are skipped).
    pub fn to_attributes(&self) -> Vec<Attribute> {
        self.attributes
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(name, list)| Attribute {
                attr_type: name.clone(),
                attr_values: list.iter().map(|v| v.as_bytes().to_vec()).collect(),
            })
            .collect()
    }

    /// Send pending changes; on success the change markers are reset.
    pub async fn modify(&mut self, conn: &mut Connection) -> Result<()> {
        conn.modify(self).await
    }

    pub async fn delete(&self, conn: &mut Connection) -> Result<()> {
        conn.delete(&self.dn.to_string(), false).await
    }

    /// Rename on the server and adopt the new DN locally.
    pub async fn rename(&mut self, conn: &mut Connection, new_dn: &str, delete_old_rdn: bool) -> Result<()> {
        let target = DistinguishedName::parse(new_dn)?;
        conn.rename(&self.dn.to_string(), new_dn, delete_old_rdn).await?;
        self.dn = target;
        Ok(())
    }
}

fn change(operation: ModifyOperation, name: &str, values: &[AttrValue]) -> ModifyChange {
    ModifyChange {
        operation,
        modification: Attribute {
            attr_type: name.to_string(),
            attr_values: values.iter().map(|v| v.as_bytes().to_vec()).collect(),
        },
    }
}
