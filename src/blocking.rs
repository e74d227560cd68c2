//! Synchronous facade over [`Connection`].
//!
//! Each `BlockingConnection` drives its session on a private current-thread
//! runtime, so it can be used from plain threads. It must not be created,
//! used or dropped from inside an async context.

use std::time::Duration;

use tokio::runtime::{Builder, Runtime};

use crate::client::Client;
use crate::connection::{Connection, ConnectionState, OpHandle, Response, SearchStream};
use crate::controls::PasswordPolicyInfo;
use crate::entry::Entry;
use crate::error::Result;
use crate::ldap_protocol::{Control, ExtendedResponse, ProtocolOp};
use crate::search::{SearchItem, SearchParams, SearchResult, VlvParams};
use crate::value_list::AttrValue;

pub struct BlockingConnection {
    conn: Connection,
    runtime: Runtime,
}

impl std::fmt::Debug for BlockingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingConnection").field("conn", &self.conn).finish()
    }
}

impl BlockingConnection {
    pub fn open(client: &Client, timeout: Option<Duration>) -> Result<(Self, Option<PasswordPolicyInfo>)> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let mut conn = Connection::new(client);
        let policy = runtime.block_on(conn.open(timeout))?;
        Ok((Self { conn, runtime }, policy))
    }

    /// The wrapped async connection.
    pub fn get_ref(&self) -> &Connection {
        &self.conn
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    pub fn password_policy(&self) -> Option<&PasswordPolicyInfo> {
        self.conn.password_policy()
    }

    pub fn add(&mut self, entry: &mut Entry) -> Result<()> {
        self.runtime.block_on(self.conn.add(entry))
    }

    pub fn delete(&mut self, dn: &str, recursive: bool) -> Result<()> {
        self.runtime.block_on(self.conn.delete(dn, recursive))
    }

    pub fn modify(&mut self, entry: &mut Entry) -> Result<()> {
        self.runtime.block_on(self.conn.modify(entry))
    }

    pub fn rename(&mut self, dn: &str, new_dn: &str, delete_old_rdn: bool) -> Result<()> {
        self.runtime.block_on(self.conn.rename(dn, new_dn, delete_old_rdn))
    }

    pub fn compare(&mut self, dn: &str, attr: &str, value: impl Into<AttrValue>) -> Result<bool> {
        self.runtime.block_on(self.conn.compare(dn, attr, value))
    }

    pub fn search(&mut self, params: &SearchParams) -> Result<SearchResult> {
        self.runtime.block_on(self.conn.search(params))
    }

    /// Lazy result sequence as a plain iterator.
    pub fn search_iter(&mut self, params: &SearchParams) -> Result<BlockingSearch<'_>> {
        let stream = self.runtime.block_on(self.conn.search_stream(params))?;
        Ok(BlockingSearch {
            runtime: &self.runtime,
            stream,
        })
    }

    pub fn paged_search(&mut self, params: &SearchParams, page_size: i32) -> Result<BlockingSearch<'_>> {
        let stream = self.runtime.block_on(self.conn.paged_search(params, page_size))?;
        Ok(BlockingSearch {
            runtime: &self.runtime,
            stream,
        })
    }

    pub fn virtual_list_search(&mut self, params: &SearchParams, vlv: &VlvParams) -> Result<SearchResult> {
        self.runtime.block_on(self.conn.virtual_list_search(params, vlv))
    }

    pub fn whoami(&mut self) -> Result<String> {
        self.runtime.block_on(self.conn.whoami())
    }

    pub fn modify_password(
        &mut self,
        user: Option<&str>,
        new_password: Option<&str>,
        old_password: Option<&str>,
    ) -> Result<Option<String>> {
        self.runtime
            .block_on(self.conn.modify_password(user, new_password, old_password))
    }

    pub fn extended(&mut self, oid: &str, value: Option<&[u8]>) -> Result<ExtendedResponse> {
        self.runtime.block_on(self.conn.extended(oid, value))
    }

    pub fn submit(&mut self, op: ProtocolOp, controls: Vec<Control>) -> Result<OpHandle> {
        self.runtime.block_on(self.conn.submit(op, controls))
    }

    pub fn wait(&mut self, handle: OpHandle, timeout: Option<Duration>) -> Result<Response> {
        self.runtime.block_on(self.conn.wait(handle, timeout))
    }

    pub fn poll(&mut self, handle: &mut OpHandle) -> Result<Option<Response>> {
        self.runtime.block_on(self.conn.poll(handle))
    }

    pub fn abandon(&mut self, msg_id: i32) -> Result<()> {
        self.runtime.block_on(self.conn.abandon(msg_id))
    }

    pub fn close(&mut self) {
        self.runtime.block_on(self.conn.close())
    }
}

impl Drop for BlockingConnection {
    fn drop(&mut self) {
        if !self.conn.is_closed() {
            self.runtime.block_on(self.conn.close());
        }
    }
}

/// Blocking view of a [`SearchStream`].
pub struct BlockingSearch<'a> {
    runtime: &'a Runtime,
    stream: SearchStream<'a>,
}

impl BlockingSearch<'_> {
    pub fn msg_id(&self) -> Option<i32> {
        self.stream.msg_id()
    }

    pub fn acquire_next_page(&mut self) -> Result<Option<i32>> {
        self.runtime.block_on(self.stream.acquire_next_page())
    }

    pub fn response_controls(&self) -> &[Control] {
        self.stream.response_controls()
    }

    /// Drain the remaining items.
    pub fn collect_all(self) -> Result<SearchResult> {
        self.runtime.block_on(self.stream.collect())
    }
}

impl Iterator for BlockingSearch<'_> {
    type Item = Result<SearchItem>;

    fn next(&mut self) -> Option<Self::Item> {
        self.runtime.block_on(self.stream.next()).transpose()
    }
}
