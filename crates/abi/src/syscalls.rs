//! Syscall wrapping: record-replay for idempotent calls, waitress-deferred
//! for effectful ones.
//!
//! `socket`/`bind` have no externally visible effect until data actually
//! moves, so they're treated like the traversal allocator: phase 0 makes
//! the real `socket(2)` call and every later phase replays its fd instead
//! of opening a second one (`bind(2)` is then idempotent enough to just
//! call for real every phase, against that same record-replayed fd).
//! `send`/`sendto`/`connect`/`close` are deferred through the engine's
//! waitress instead — recorded by every phase, verified to agree, and
//! issued for real exactly once at commit via [`drain_pending_calls`].

use std::cell::RefCell;

use crate::memory::ProcessMemory;
use crate::transaction::with_engine;

thread_local! {
    static SOCKET_LOG: RefCell<Vec<i32>> = RefCell::new(Vec::new());
    static SOCKET_CURSOR: RefCell<usize> = const { RefCell::new(0) };
}

/// Identifies which deferred call a waitress entry is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallTag {
    Send,
    SendTo,
    Connect,
    Close,
}

impl CallTag {
    const fn as_usize(self) -> usize {
        match self {
            Self::Send => 0,
            Self::SendTo => 1,
            Self::Connect => 2,
            Self::Close => 3,
        }
    }

    const fn from_usize(tag: usize) -> Option<Self> {
        match tag {
            0 => Some(Self::Send),
            1 => Some(Self::SendTo),
            2 => Some(Self::Connect),
            3 => Some(Self::Close),
            _ => None,
        }
    }
}

/// Record-replay `socket(2)`: phase 0 opens a real socket and logs the fd;
/// every later phase returns the logged fd without opening a second one.
///
/// # Safety
///
/// Forwards directly to libc's `socket`; no additional preconditions.
#[no_mangle]
pub unsafe extern "C" fn sei_socket(domain: i32, ty: i32, protocol: i32) -> i32 {
    let phase = with_engine(sei_core::Engine::current_phase).unwrap_or(0);
    if phase == 0 {
        let fd = libc::socket(domain, ty, protocol);
        SOCKET_LOG.with(|l| l.borrow_mut().push(fd));
        fd
    } else {
        let idx = SOCKET_CURSOR.with(|c| {
            let mut cursor = c.borrow_mut();
            let i = *cursor;
            *cursor += 1;
            i
        });
        SOCKET_LOG.with(|l| l.borrow().get(idx).copied().unwrap_or(-1))
    }
}

/// `bind(2)`, called for real on every phase against the record-replayed
/// fd from [`sei_socket`].
///
/// # Safety
///
/// `addr` must point to a valid `sockaddr` of `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn sei_bind(fd: i32, addr: *const libc::sockaddr, len: libc::socklen_t) -> i32 {
    libc::bind(fd, addr, len)
}

/// Defers a `send(2)` call to commit time.
///
/// # Safety
///
/// `buf` must be valid to read for `len` bytes for as long as this
/// transaction has not yet committed.
#[no_mangle]
pub unsafe extern "C" fn sei_send(fd: i32, buf: *const u8, len: usize, flags: i32) {
    defer(CallTag::Send, vec![fd as u64, buf as u64, len as u64, flags as u64]);
}

/// Defers a `sendto(2)` call to commit time.
///
/// # Safety
///
/// `buf` must be valid to read for `len` bytes and `dst` for `dstlen`
/// bytes, both until this transaction commits.
#[no_mangle]
pub unsafe extern "C" fn sei_sendto(
    fd: i32,
    buf: *const u8,
    len: usize,
    flags: i32,
    dst: *const libc::sockaddr,
    dstlen: libc::socklen_t,
) {
    defer(
        CallTag::SendTo,
        vec![fd as u64, buf as u64, len as u64, flags as u64, dst as u64, u64::from(dstlen)],
    );
}

/// Defers a `connect(2)` call to commit time.
///
/// # Safety
///
/// `addr` must point to a valid `sockaddr` of `len` bytes, until this
/// transaction commits.
#[no_mangle]
pub unsafe extern "C" fn sei_connect(fd: i32, addr: *const libc::sockaddr, len: libc::socklen_t) {
    defer(CallTag::Connect, vec![fd as u64, addr as u64, u64::from(len)]);
}

/// Defers a `close(2)` call to commit time.
#[no_mangle]
pub extern "C" fn sei_close(fd: i32) {
    defer(CallTag::Close, vec![fd as u64]);
}

fn defer(tag: CallTag, args: Vec<u64>) {
    with_engine(|engine| {
        let mut mem = ProcessMemory;
        engine
            .transaction(&mut mem)
            .defer_call(tag.as_usize(), args)
            .expect("waitress capacity exceeded")
    });
}

/// Actually issues every deferred call the engine's waitress agreed on at
/// the most recent commit. Called by
/// [`crate::transaction::commit_transaction`] after a successful commit.
pub fn drain_pending_calls() {
    let calls = with_engine(sei_core::Engine::take_calls);
    for item in calls {
        let Some(tag) = CallTag::from_usize(item.tag) else {
            tracing::warn!(tag = item.tag, "unknown deferred syscall tag");
            continue;
        };
        let fd = item.args[0] as i32;
        match tag {
            CallTag::Send => {
                let ptr = item.args[1] as usize;
                let len = item.args[2] as usize;
                let flags = item.args[3] as i32;
                // SAFETY: `ptr`/`len` were captured from a live buffer at
                // defer time and the transaction has not yet returned to
                // its caller, so the buffer is still live.
                unsafe {
                    libc::send(fd, ptr as *const libc::c_void, len, flags);
                }
            }
            CallTag::SendTo => {
                let ptr = item.args[1] as usize;
                let len = item.args[2] as usize;
                let flags = item.args[3] as i32;
                let dst = item.args[4] as usize;
                let dstlen = item.args[5] as libc::socklen_t;
                // SAFETY: as above, for both buffer and destination address.
                unsafe {
                    libc::sendto(
                        fd,
                        ptr as *const libc::c_void,
                        len,
                        flags,
                        dst as *const libc::sockaddr,
                        dstlen,
                    );
                }
            }
            CallTag::Connect => {
                let addr = item.args[1] as usize;
                let len = item.args[2] as libc::socklen_t;
                // SAFETY: `addr` was captured from a live sockaddr at defer time.
                unsafe {
                    libc::connect(fd, addr as *const libc::sockaddr, len);
                }
            }
            CallTag::Close => {
                // SAFETY: fd ownership is deferred to exactly this one real close.
                unsafe {
                    libc::close(fd);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_tag_round_trips_through_usize() {
        for tag in [CallTag::Send, CallTag::SendTo, CallTag::Connect, CallTag::Close] {
            assert_eq!(CallTag::from_usize(tag.as_usize()), Some(tag));
        }
    }
}
