//! Process spawning
//!
//! A spawn request travels over the `process/spawn` channel: the payload
//! names the resources the child receives (paired positionally with the
//! message's attached handles) followed by the ELF image; the kernel's
//! spawn service validates the image, builds the address space, and
//! enqueues the child.
//!
//! Wire format of the payload:
//!
//! ```text
//! u64 resource_count
//! resource_count × [u8; 32] resource names
//! ELF image bytes
//! ```

use alloc::boxed::Box;
use alloc::vec::Vec;

use sable_abi::{ResourceName, RESOURCE_NAME_MAX};
use spin::{Mutex, Once};

use crate::arch;
use crate::error::{KError, KResult};
use crate::ipc::channel::{reply_to, Channel, ReceiveRef};
use crate::ipc::{AttachedHandle, Message};
use crate::memory::address::{PAGE_SIZE, USER_ADDR_UPPER_BOUND};
use crate::memory::paging;
use crate::process::{elf, Process, Resource, ResourceMap};
use crate::sched;

/// Top of a fresh process's user stack.
pub const USER_STACK_TOP: u64 = USER_ADDR_UPPER_BOUND;
/// Size of the initial user stack mapping.
pub const USER_STACK_SIZE: u64 = 16 * PAGE_SIZE;

/// Split a spawn payload into resource names and the ELF image.
pub fn parse_spawn_message(data: &[u8]) -> KResult<(Vec<ResourceName>, &[u8])> {
    if data.len() < 8 {
        return Err(KError::MessageDataTooShort);
    }
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&data[0..8]);
    let count = u64::from_le_bytes(count_bytes) as usize;
    let names_end = count
        .checked_mul(RESOURCE_NAME_MAX)
        .and_then(|names| names.checked_add(8))
        .ok_or(KError::InvalidArg)?;
    if data.len() < names_end {
        return Err(KError::MessageDataTooShort);
    }
    let mut names = Vec::with_capacity(count);
    for i in 0..count {
        let at = 8 + i * RESOURCE_NAME_MAX;
        let mut bytes = [0u8; RESOURCE_NAME_MAX];
        bytes.copy_from_slice(&data[at..at + RESOURCE_NAME_MAX]);
        names.push(ResourceName::from_bytes(bytes));
    }
    Ok((names, &data[names_end..]))
}

/// Build a child's resource map from paired names and attached handles.
pub fn resources_from_handles(
    names: Vec<ResourceName>,
    handles: Vec<AttachedHandle>,
) -> KResult<ResourceMap> {
    if names.len() != handles.len() {
        return Err(KError::InvalidArg);
    }
    let entries = names
        .into_iter()
        .zip(handles)
        .map(|(name, handle)| {
            let resource = match handle {
                AttachedHandle::ChannelSend(send) => Resource::ChannelSend(send),
                AttachedHandle::ChannelReceive(receive) => Resource::ChannelReceive(receive),
                AttachedHandle::Message(message) => Resource::Message(message),
            };
            (name, resource)
        })
        .collect();
    Ok(ResourceMap::new(entries))
}

/// Create a process from an ELF image, ready to run.
///
/// Builds a fresh address space, loads the segments into it, maps the user
/// stack, and enqueues the process. On any failure the address space is
/// torn down and nothing is left behind.
pub fn spawn(file: &[u8], resources: ResourceMap) -> KResult<()> {
    let image = elf::parse(file)?;
    let address_space = paging::address_space_create()?;

    // Populate the child's user half through its own page tables. Preemption
    // must not catch us on a borrowed CR3.
    sched::preempt_disable();
    let old_cr3 = arch::read_cr3();
    let populate = (|| unsafe {
        arch::write_cr3(address_space.as_u64());
        let result = populate_user_half(file, &image);
        arch::write_cr3(old_cr3);
        result
    })();
    sched::preempt_enable();

    if let Err(err) = populate {
        unsafe { paging::address_space_destroy(address_space) };
        return Err(err);
    }

    let process = Process::new_user(address_space, image.entry, USER_STACK_TOP, resources);
    let process = match process {
        Ok(process) => process,
        Err(err) => {
            unsafe { paging::address_space_destroy(address_space) };
            return Err(err);
        }
    };
    unsafe { sched::enqueue(process) };
    Ok(())
}

unsafe fn populate_user_half(file: &[u8], image: &elf::ElfImage) -> KResult<()> {
    elf::load(file, image)?;
    paging::map_user_pages(USER_STACK_TOP - USER_STACK_SIZE, USER_STACK_SIZE, true, false)?;
    // Fresh frames carry stale contents.
    core::ptr::write_bytes(
        (USER_STACK_TOP - USER_STACK_SIZE) as *mut u8,
        0,
        USER_STACK_SIZE as usize,
    );
    Ok(())
}

static SPAWN_CHANNEL: Once<ReceiveRef> = Once::new();

/// Resources that kernel services publish for the init process, keyed by
/// name. Device services register theirs before init is spawned.
static BOOT_RESOURCES: Mutex<Vec<(ResourceName, Resource)>> = Mutex::new(Vec::new());

/// Publish a resource into the init process's namespace.
pub fn register_boot_resource(name: ResourceName, resource: Resource) {
    BOOT_RESOURCES.lock().push((name, resource));
}

/// The spawn service: a kernel thread answering `process/spawn` requests.
fn spawn_service() -> ! {
    let receiver = SPAWN_CHANNEL.get().expect("spawn service has no channel");
    loop {
        let mut message = match receiver.receive(false) {
            Ok(message) => message,
            Err(_) => continue,
        };
        let result = handle_spawn_request(&mut message);
        let reply = match result {
            Ok(()) => Box::new(Message::empty()),
            Err(err) => Box::new(Message::from_error(err.user_code().code())),
        };
        if reply_to(&mut message, reply).is_err() {
            crate::kdebug!("spawn: requester vanished before the reply");
        }
    }
}

fn handle_spawn_request(message: &mut Message) -> KResult<()> {
    let (names, file) = parse_spawn_message(&message.data)?;
    let handles = core::mem::take(&mut message.handles);
    let resources = resources_from_handles(names, handles)?;
    // The borrow of message.data ends before spawn consumes the file slice.
    spawn(file, resources)
}

/// Start the spawn service and launch the init process from the embedded
/// image, handing it the `process/spawn` endpoint and every registered
/// boot resource.
pub fn spawn_init(image: &[u8]) -> KResult<()> {
    let (spawn_send, spawn_recv) = Channel::create();
    SPAWN_CHANNEL.call_once(|| spawn_recv);
    let service = Process::new_kernel(spawn_service, ResourceMap::empty())?;
    unsafe { sched::enqueue(service) };

    let mut entries: Vec<(ResourceName, Resource)> = BOOT_RESOURCES.lock().drain(..).collect();
    entries.push((
        ResourceName::new("process/spawn"),
        Resource::ChannelSend(spawn_send),
    ));
    spawn(image, ResourceMap::new(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn spawn_payload_round_trip() {
        let mut data = Vec::new();
        data.extend_from_slice(&2u64.to_le_bytes());
        data.extend_from_slice(&ResourceName::new("virt_drive/read").bytes);
        data.extend_from_slice(&ResourceName::new("virt_drive/info").bytes);
        data.extend_from_slice(b"\x7fELF...");

        let (names, file) = parse_spawn_message(&data).unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0], ResourceName::new("virt_drive/read"));
        assert_eq!(names[1], ResourceName::new("virt_drive/info"));
        assert_eq!(file, b"\x7fELF...");
    }

    #[test]
    fn truncated_payloads_are_rejected() {
        assert!(matches!(
            parse_spawn_message(&[0; 4]),
            Err(KError::MessageDataTooShort)
        ));
        let mut data = Vec::new();
        data.extend_from_slice(&3u64.to_le_bytes());
        data.extend_from_slice(&[0; RESOURCE_NAME_MAX]); // only one of three names
        assert!(matches!(
            parse_spawn_message(&data),
            Err(KError::MessageDataTooShort)
        ));
    }

    #[test]
    fn resource_count_overflow_is_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(
            parse_spawn_message(&data),
            Err(KError::InvalidArg)
        ));
    }

    #[test]
    fn name_handle_pairing() {
        let (tx, _rx) = crate::ipc::Channel::create();
        let map = resources_from_handles(
            vec![ResourceName::new("svc/chan")],
            vec![AttachedHandle::ChannelSend(tx)],
        )
        .unwrap();
        assert!(map
            .get(
                &ResourceName::new("svc/chan"),
                sable_abi::ResourceKind::ChannelSend
            )
            .is_ok());

        let err = resources_from_handles(vec![ResourceName::new("odd")], vec![]);
        assert!(matches!(err, Err(KError::InvalidArg)));
    }
}
