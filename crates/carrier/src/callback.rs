use {log::warn, std::collections::BTreeMap};

/// Closure run once a message has been fully transmitted (unreliable) or
/// acknowledged (reliable).
pub(crate) type Callback = Box<dyn FnOnce() + Send>;

/// Delivery callbacks registered on one channel of one connection.
///
/// Every callback gets a stamp in registration order. Callbacks only become
/// ready once every earlier callback in the stream is ready too, so they run
/// in the order their messages were sent.
#[derive(Default)]
pub(crate) struct CallbackStream {
    next_stamp: u64,
    pending: BTreeMap<u64, Slot>,
    last_fired: Option<u64>,
}

struct Slot {
    callback: Callback,
    done: bool,
}

impl CallbackStream {
    pub fn register(&mut self, callback: Callback) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.pending.insert(
            stamp,
            Slot {
                callback,
                done: false,
            },
        );
        stamp
    }

    pub fn complete(&mut self, stamp: u64, ready: &mut Vec<Callback>) {
        if let Some(slot) = self.pending.get_mut(&stamp) {
            slot.done = true;
        }

        while let Some(entry) = self.pending.first_entry() {
            if !entry.get().done {
                break;
            }
            let (stamp, slot) = entry.remove_entry();
            if let Some(last) = self.last_fired.filter(|last| stamp <= *last) {
                warn!("callback {stamp} would run after callback {last}, dropping it");
                continue;
            }
            self.last_fired = Some(stamp);
            ready.push(slot.callback);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
