//! Typed handle on one sharded list.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use skv_common::{BackendClient, BackendManager, ShardResult};

use crate::client::ShardedClient;
use crate::codec::decode;

/// A list of JSON-encoded `T` values stored under one key.
///
/// The handle holds no data; every call goes through the owning client.
pub struct ShardedList<'c, M: BackendManager, T> {
    client: &'c ShardedClient<M>,
    id: String,
    _marker: PhantomData<fn() -> T>,
}

impl<'c, M: BackendManager, T> ShardedList<'c, M, T> {
    pub(crate) fn new(client: &'c ShardedClient<M>, id: String) -> Self {
        ShardedList {
            client,
            id,
            _marker: PhantomData,
        }
    }

    /// Key the list is stored under.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Empties the list on every mirror.
    pub fn clear(&self) -> ShardResult<()> {
        self.client.remove_all_from_list(&self.id)
    }
}

impl<'c, M: BackendManager, T: Serialize> ShardedList<'c, M, T> {
    /// Appends `item` on every mirror.
    pub fn push(&self, item: &T) -> ShardResult<()> {
        self.client.push_item_to_list(&self.id, item)
    }
}

impl<'c, M: BackendManager, T: DeserializeOwned> ShardedList<'c, M, T> {
    /// Reads every item from the read target, in list order.
    pub fn items(&self) -> ShardResult<Vec<T>> {
        let id = self.id.as_str();
        self.client
            .read(id, |client| client.list_range(id, 0, -1))?
            .iter()
            .map(|data| decode(data))
            .collect()
    }
}
