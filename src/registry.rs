use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::info;

use crate::event_loop::LoopHandle;
use crate::protocol::RoomInfo;
use crate::room::Room;

/// First room id ever allocated.
pub const FIRST_ROOM_ID: u64 = 1001;

struct Inner {
    rooms: HashMap<u64, Arc<Room>>,
    next_id: u64,
}

/// Process-wide room lookup.
///
/// Injected into the server at construction rather than exposed as a global.
/// One mutex guards the map and the id allocator; ids start at 1001 and are
/// never reused within a process lifetime, destruction included.
pub struct RoomRegistry {
    mix_handle: Arc<LoopHandle>,
    inner: Mutex<Inner>,
}

impl RoomRegistry {
    /// Creates a registry whose rooms tick on the loop behind `mix_handle`.
    pub fn new(mix_handle: Arc<LoopHandle>) -> RoomRegistry {
        RoomRegistry {
            mix_handle,
            inner: Mutex::new(Inner {
                rooms: HashMap::new(),
                next_id: FIRST_ROOM_ID,
            }),
        }
    }

    /// Creates a room, allocates its id and starts its mix tick.
    pub fn create(&self, name: &str, owner: u64) -> Result<Arc<Room>, opus::Error> {
        let room = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            let room = Room::new(id, name, owner, Arc::clone(&self.mix_handle))?;
            inner.next_id += 1;
            inner.rooms.insert(id, Arc::clone(&room));
            room
        };
        room.start_ticking();
        info!("created room {} [{}], owner {}", room.id(), name, owner);
        Ok(room)
    }

    pub fn find(&self, id: u64) -> Option<Arc<Room>> {
        self.inner.lock().unwrap().rooms.get(&id).cloned()
    }

    /// Unregisters the room and cancels its tick. Users still holding the
    /// room keep it alive until their references drop; its id is gone for
    /// good either way.
    pub fn destroy(&self, id: u64) -> bool {
        let room = self.inner.lock().unwrap().rooms.remove(&id);
        match room {
            Some(room) => {
                room.stop_ticking();
                info!("destroyed room {} [{}]", room.id(), room.name());
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<RoomInfo> {
        let rooms: Vec<Arc<Room>> = self.inner.lock().unwrap().rooms.values().cloned().collect();
        rooms.iter().map(|room| room.info()).collect()
    }

    pub fn room_count(&self) -> usize {
        self.inner.lock().unwrap().rooms.len()
    }
}
