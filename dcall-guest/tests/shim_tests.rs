//! Shim tests: hook installation, lazy registration, fast/slow routing.

use std::sync::Arc;

use dcall_api::nr::{
    SYS_FORK, SYS_READ, SYS_REGISTER_CONTROL_PAGE, SYSCALL_ARGS, SyscallArgs,
};
use dcall_api::{PAGE_SIZE, Result, VirtAddr};
use dcall_guest::{DIVERGENT_SYSCALLS, GenericEntryHook, HookSlot, Shim};
use dcall_host::sched::Thread;
use dcall_host::syscall::SyscallHandler;
use dcall_host::{Host, HostConfig, VmBacking};

struct FixedHandler {
    nr: u32,
    result: isize,
}

impl SyscallHandler for FixedHandler {
    fn id(&self) -> u32 {
        self.nr
    }

    fn name(&self) -> &str {
        "fixed"
    }

    fn execute(&self, _thread: &Thread, _args: &SyscallArgs) -> Result<isize> {
        Ok(self.result)
    }
}

fn args(nr: u32, a2: usize) -> SyscallArgs {
    let mut args = [0usize; SYSCALL_ARGS];
    args[0] = nr as usize;
    args[1] = a2;
    args
}

struct Fixture {
    host: Host,
    slot: HookSlot,
    shim: Arc<Shim>,
}

fn fixture(config: HostConfig) -> Fixture {
    let host = Host::new(config);
    host.table().register_handler(Box::new(FixedHandler {
        nr: SYS_READ,
        result: 7,
    }));
    host.table().register_handler(Box::new(FixedHandler {
        nr: SYS_FORK,
        result: 1234,
    }));
    let slot = HookSlot::new(Arc::new(GenericEntryHook::new(Arc::clone(
        host.dispatcher(),
    ))));
    let shim = Shim::install(&slot, Arc::clone(host.fast_entry()));
    Fixture { host, slot, shim }
}

#[test]
fn fast_dispatch_after_explicit_registration() {
    let f = fixture(HostConfig {
        cpus: 4,
        fast_path_disabled: Vec::new(),
    });
    let mm = f.host.create_address_space();
    let thread = f.host.spawn_thread(&mm, Some(2)).unwrap();
    mm.map_anon_at(VirtAddr::new(0x1000), PAGE_SIZE).unwrap();

    // Explicit registration while pinned to cpu 2.
    assert_eq!(
        f.host
            .dispatcher()
            .dispatch(&thread, &args(SYS_REGISTER_CONTROL_PAGE, 0x1000)),
        0
    );
    assert_eq!(
        mm.vma_at(VirtAddr::new(0x1000)).unwrap().backing,
        VmBacking::ControlPage(2)
    );

    // A non-divergent syscall now goes straight through the fast entry.
    let ret = f.slot.call(&thread, &args(SYS_READ, 0x5555));
    assert_eq!(ret, 7);

    let stats = f.shim.stats();
    assert_eq!(stats.fast_calls, 1);
    assert_eq!(stats.slow_calls, 0);

    // The entry's saved exchange fields reflect the call's register
    // arguments under the direct-call convention.
    let entry = f.host.store().entry(2).unwrap();
    assert_eq!(entry.rcx(), SYS_READ as u64);
    assert_eq!(entry.r11(), 0x5555);
    assert_eq!(entry.rip(), 0x40_0002);
    assert_eq!(entry.rsp(), thread.user_rsp());
    assert_eq!(
        entry.switch_flags() & dcall_host::control_page::SWITCH_FLAGS_DIRECT,
        0
    );
}

#[test]
fn first_fast_dispatch_registers_lazily_exactly_once() {
    let f = fixture(HostConfig::default());
    let mm = f.host.create_address_space();
    let thread = f.host.spawn_thread(&mm, Some(1)).unwrap();

    assert_eq!(f.slot.call(&thread, &args(SYS_READ, 1)), 7);
    assert_eq!(f.slot.call(&thread, &args(SYS_READ, 2)), 7);

    let stats = f.shim.stats();
    assert_eq!(stats.registrations, 1);
    assert_eq!(stats.fast_calls, 2);

    // The shim mapped a scratch page and it is now the overlay.
    let registration = thread.registration().unwrap();
    assert_eq!(
        mm.vma_at(registration.addr).unwrap().backing,
        VmBacking::ControlPage(1)
    );
}

#[test]
fn threads_register_independently() {
    let f = fixture(HostConfig::default());
    let mm = f.host.create_address_space();
    let a = f.host.spawn_thread(&mm, Some(0)).unwrap();
    let b = f.host.spawn_thread(&mm, Some(1)).unwrap();

    assert_eq!(f.slot.call(&a, &args(SYS_READ, 1)), 7);
    assert_eq!(f.slot.call(&b, &args(SYS_READ, 1)), 7);
    assert_eq!(f.shim.stats().registrations, 2);

    let reg_a = a.registration().unwrap();
    let reg_b = b.registration().unwrap();
    assert_ne!(reg_a.addr, reg_b.addr);
    assert_eq!(mm.vma_at(reg_a.addr).unwrap().backing, VmBacking::ControlPage(0));
    assert_eq!(mm.vma_at(reg_b.addr).unwrap().backing, VmBacking::ControlPage(1));
}

#[test]
fn divergent_syscalls_take_the_slow_path() {
    let f = fixture(HostConfig::default());
    let mm = f.host.create_address_space();
    let thread = f.host.spawn_thread(&mm, Some(0)).unwrap();

    assert_eq!(f.slot.call(&thread, &args(SYS_FORK, 0)), 1234);
    for nr in DIVERGENT_SYSCALLS {
        if nr != SYS_FORK {
            // No handlers registered for the rest; the generic dispatcher's
            // error comes back unchanged.
            assert!(f.slot.call(&thread, &args(nr, 0)) < 0);
        }
    }

    let stats = f.shim.stats();
    assert_eq!(stats.fast_calls, 0);
    assert_eq!(stats.slow_calls, DIVERGENT_SYSCALLS.len() as u64);
    // The slow path never triggers registration.
    assert_eq!(stats.registrations, 0);
    assert!(thread.registration().is_none());
}

#[test]
fn disabled_cpu_pins_thread_to_slow_path() {
    let f = fixture(HostConfig {
        cpus: 2,
        fast_path_disabled: vec![0],
    });
    let mm = f.host.create_address_space();
    let thread = f.host.spawn_thread(&mm, Some(0)).unwrap();

    // Registration fails with remap_failed; the call still completes via
    // the fallback, and only one attempt is ever made.
    assert_eq!(f.slot.call(&thread, &args(SYS_READ, 1)), 7);
    assert_eq!(f.slot.call(&thread, &args(SYS_READ, 2)), 7);

    let stats = f.shim.stats();
    assert_eq!(stats.fast_calls, 0);
    assert_eq!(stats.slow_calls, 2);
    assert_eq!(stats.registrations, 1);
    assert!(thread.registration().is_none());
}

#[test]
fn install_retains_the_original_hook_as_fallback() {
    let host = Host::new(HostConfig::default());
    host.table().register_handler(Box::new(FixedHandler {
        nr: SYS_FORK,
        result: 99,
    }));
    let slot = HookSlot::new(Arc::new(GenericEntryHook::new(Arc::clone(
        host.dispatcher(),
    ))));

    let mm = host.create_address_space();
    let thread = host.spawn_thread(&mm, Some(0)).unwrap();

    // Before installation the slot is the generic entry.
    assert_eq!(slot.call(&thread, &args(SYS_FORK, 0)), 99);
    let _shim = Shim::install(&slot, Arc::clone(host.fast_entry()));
    // After installation divergent calls still reach the same handler,
    // through the retained fallback.
    assert_eq!(slot.call(&thread, &args(SYS_FORK, 0)), 99);
    assert_eq!(host.dispatcher().stats().calls_by_nr.get(&SYS_FORK), Some(&2));
}
