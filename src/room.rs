use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, info, trace};

use crate::codec;
use crate::event_loop::LoopHandle;
use crate::mixer::AudioMixer;
use crate::net::TcpConnection;
use crate::protocol::{Message, NotificationKind, RoomInfo, RoomNotification};
use crate::queue::DrainQueue;
use crate::timer::TimerId;

/// Period of the mix tick.
pub const TICK_INTERVAL: Duration = Duration::from_millis(20);

/// One logged-in participant.
///
/// A user belongs to at most one room. The room holds the strong reference to
/// its users; the user only holds a weak one back, so dropping a room never
/// leaks through the membership cycle, and [`room`] simply resolves to `None`
/// once the room is gone.
///
/// [`room`]: User::room
pub struct User {
    id: u64,
    username: String,
    connection: Arc<TcpConnection>,
    room: Mutex<Weak<Room>>,
}

impl User {
    pub fn new(id: u64, username: &str, connection: Arc<TcpConnection>) -> Arc<User> {
        Arc::new(User {
            id,
            username: username.to_string(),
            connection,
            room: Mutex::new(Weak::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn connection(&self) -> &Arc<TcpConnection> {
        &self.connection
    }

    /// The room this user is currently in, if it still exists.
    pub fn room(&self) -> Option<Arc<Room>> {
        self.room.lock().unwrap().upgrade()
    }

    fn set_room(&self, room: &Arc<Room>) {
        *self.room.lock().unwrap() = Arc::downgrade(room);
    }

    fn clear_room(&self) {
        *self.room.lock().unwrap() = Weak::new();
    }
}

/// A named bag of users sharing one mixer.
///
/// Audio frames from members pile up in the pending queue; every 20 ms the
/// tick (running on the mix loop) swaps the queue empty, mixes what arrived
/// into one encoded packet and fans it out to every member. Membership and
/// the user's back-reference change together under the member mutex, which is
/// never held across I/O or mixing.
pub struct Room {
    id: u64,
    name: String,
    owner: u64,
    members: Mutex<HashMap<u64, Arc<User>>>,
    pending: DrainQueue<Vec<u8>>,
    mixer: Mutex<AudioMixer>,
    mix_handle: Arc<LoopHandle>,
    tick_timer: Mutex<Option<TimerId>>,
    self_ref: Weak<Room>,
}

impl Room {
    pub(crate) fn new(
        id: u64,
        name: &str,
        owner: u64,
        mix_handle: Arc<LoopHandle>,
    ) -> Result<Arc<Room>, opus::Error> {
        let mixer = AudioMixer::new()?;
        Ok(Arc::new_cyclic(|self_ref| Room {
            id,
            name: name.to_string(),
            owner,
            members: Mutex::new(HashMap::new()),
            pending: DrainQueue::new(),
            mixer: Mutex::new(mixer),
            mix_handle,
            tick_timer: Mutex::new(None),
            self_ref: self_ref.clone(),
        }))
    }

    fn arc(&self) -> Arc<Room> {
        // Created by `Arc::new_cyclic`; `self` is only reachable through the
        // Arc, so the upgrade cannot fail while a method is executing.
        self.self_ref.upgrade().expect("room used after drop")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the user who created the room.
    pub fn owner(&self) -> u64 {
        self.owner
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id,
            name: self.name.clone(),
            members: self.member_count(),
        }
    }

    /// Registers the repeating mix tick on the mix loop. The timer holds only
    /// a weak reference, so an unregistered room cannot be kept alive by its
    /// own tick.
    pub(crate) fn start_ticking(&self) {
        let weak = self.self_ref.clone();
        let room = self.arc();
        self.mix_handle.run_in_loop(move |lp| {
            let id = lp.add_timer(TICK_INTERVAL, Some(TICK_INTERVAL), move |_lp| {
                if let Some(room) = weak.upgrade() {
                    room.tick();
                }
            });
            *room.tick_timer.lock().unwrap() = Some(id);
        });
    }

    pub(crate) fn stop_ticking(&self) {
        if let Some(id) = self.tick_timer.lock().unwrap().take() {
            self.mix_handle.run_in_loop(move |lp| {
                lp.cancel_timer(id);
            });
        }
    }

    /// Adds `user` and announces the join to everyone else. The membership
    /// map and `user.room` change in the same critical section, so "member
    /// implies user.room == this" holds at every instant.
    pub fn add_user(&self, user: &Arc<User>) {
        {
            let mut members = self.members.lock().unwrap();
            user.set_room(&self.arc());
            members.insert(user.id(), Arc::clone(user));
        }
        info!("room {} [{}]: {} joined", self.id, self.name, user.username());

        let note = RoomNotification {
            kind: NotificationKind::Join,
            user_id: user.id(),
            username: user.username().to_string(),
            message: format!("{} joined the room", user.username()),
        };
        self.broadcast(&Message::Notification(note), Some(user.id()));
    }

    /// Removes the user and announces the leave to the remaining members.
    pub fn remove_user(&self, user_id: u64) -> Option<Arc<User>> {
        let user = {
            let mut members = self.members.lock().unwrap();
            let user = members.remove(&user_id);
            if let Some(user) = &user {
                user.clear_room();
            }
            user
        }?;
        info!("room {} [{}]: {} left", self.id, self.name, user.username());

        let note = RoomNotification {
            kind: NotificationKind::Leave,
            user_id: user.id(),
            username: user.username().to_string(),
            message: format!("{} left the room", user.username()),
        };
        self.broadcast(&Message::Notification(note), None);
        Some(user)
    }

    /// Queues one encoded frame from `user_id` for the next tick. The sender
    /// identity matters only for the log; the mixer is sender-agnostic.
    pub fn on_audio(&self, user_id: u64, frame: Vec<u8>) {
        trace!(
            "room {}: {} byte audio frame from user {}",
            self.id,
            frame.len(),
            user_id
        );
        self.pending.push(frame);
    }

    /// Snapshot of the current members.
    pub fn members(&self) -> Vec<Arc<User>> {
        self.members.lock().unwrap().values().cloned().collect()
    }

    /// Sends `message` to every member except `skip`. Encodes once, fans out
    /// many.
    pub fn broadcast(&self, message: &Message, skip: Option<u64>) {
        let bytes = codec::frame_bytes(&message.encode());
        for user in self.members() {
            if skip == Some(user.id()) {
                continue;
            }
            user.connection().send(&bytes);
        }
    }

    /// One mix cycle. Runs on the mix loop every [`TICK_INTERVAL`].
    fn tick(&self) {
        // Swap the queue empty first so producers never wait on the mix.
        let mut frames = Vec::new();
        self.pending.drain(&mut frames);
        if frames.is_empty() {
            return;
        }
        debug!("room {}: mixing {} frames", self.id, frames.len());

        let packet = match self.mixer.lock().unwrap().mix(&frames) {
            Some(packet) => packet,
            None => return,
        };

        let bytes = codec::frame_bytes(&Message::Audio(packet).encode());
        for user in self.members() {
            user.connection().send(&bytes);
        }
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        debug!("room {} [{}] dropped", self.id, self.name);
    }
}
