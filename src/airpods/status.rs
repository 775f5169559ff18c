//! Last-known value of every control command reported by the accessory.

use std::{
   collections::BTreeMap,
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
   time::Instant,
};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::airpods::protocol::ControlCommandId;

/// Raw control command value bytes.
pub type CommandValue = SmallVec<[u8; 4]>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommandStatus {
   pub identifier: ControlCommandId,
   pub value: CommandValue,
   pub last_updated: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&ControlCommandStatus) + Send + Sync>;

#[derive(Default)]
struct StoreState {
   values: BTreeMap<ControlCommandId, ControlCommandStatus>,
   subscribers: BTreeMap<ControlCommandId, Vec<(SubscriptionId, Handler)>>,
}

#[derive(Default)]
struct StoreInner {
   state: Mutex<StoreState>,
   next_id: AtomicU64,
}

/// Shared handle to the control command status table.
///
/// Updates install the value before any subscriber runs, and handlers are
/// invoked outside the lock so they may call back into the store.
#[derive(Clone, Default)]
pub struct CommandStatusStore(Arc<StoreInner>);

impl CommandStatusStore {
   pub fn new() -> Self {
      Self::default()
   }

   /// Installs `value` for `id` and synchronously notifies its subscribers.
   pub fn record_update(&self, id: ControlCommandId, value: &[u8]) -> ControlCommandStatus {
      let status = ControlCommandStatus {
         identifier: id,
         value: CommandValue::from_slice(value),
         last_updated: Instant::now(),
      };
      let handlers: SmallVec<[Handler; 4]> = {
         let mut state = self.0.state.lock();
         state.values.insert(id, status.clone());
         state
            .subscribers
            .get(&id)
            .map(|subs| subs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
      };
      for handler in handlers {
         handler(&status);
      }
      status
   }

   pub fn query(&self, id: ControlCommandId) -> Option<ControlCommandStatus> {
      self.0.state.lock().values.get(&id).cloned()
   }

   pub fn subscribe(
      &self,
      id: ControlCommandId,
      handler: impl Fn(&ControlCommandStatus) + Send + Sync + 'static,
   ) -> SubscriptionId {
      let sub = SubscriptionId(self.0.next_id.fetch_add(1, Ordering::Relaxed));
      self
         .0
         .state
         .lock()
         .subscribers
         .entry(id)
         .or_default()
         .push((sub, Arc::new(handler)));
      sub
   }

   /// Removes a subscription. Returns whether it existed.
   pub fn unsubscribe(&self, id: ControlCommandId, sub: SubscriptionId) -> bool {
      let mut state = self.0.state.lock();
      let Some(subs) = state.subscribers.get_mut(&id) else {
         return false;
      };
      let before = subs.len();
      subs.retain(|(s, _)| *s != sub);
      let removed = subs.len() != before;
      if subs.is_empty() {
         state.subscribers.remove(&id);
      }
      removed
   }

   /// Forgets every recorded value. Subscriptions are kept.
   pub fn clear(&self) {
      self.0.state.lock().values.clear();
   }

   /// All recorded values ordered by identifier.
   pub fn snapshot(&self) -> Vec<ControlCommandStatus> {
      self.0.state.lock().values.values().cloned().collect()
   }
}

impl std::fmt::Debug for CommandStatusStore {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      let state = self.0.state.lock();
      f.debug_struct("CommandStatusStore")
         .field("values", &state.values.len())
         .field("subscribed_ids", &state.subscribers.len())
         .finish()
   }
}
