//! Setup and teardown of the syscall buffer: a shm segment mapped at the
//! same address range in tracer and tracee, which the tracee's preload
//! library fills with syscall records without tracer involvement.

use super::{read_val_mem, write_val_mem, Task};
use crate::auto_remote_syscalls::{AutoRemoteSyscalls, AutoRestoreMem};
use crate::file_monitor::PreserveFileMonitor;
use crate::kernel_abi::{
    syscall_number_for_close, syscall_number_for_munmap, syscall_number_for_openat, Architecture,
};
use crate::log::LogDebug;
use crate::preload_interface::{
    rtcall_init_buffers_params, rtcall_init_preload_params, syscallbuf_hdr,
    RETRACE_RESERVED_ROOT_DIR_FD, SYSCALLBUF_BUFFER_SIZE, SYSCALLBUF_SHMEM_PATH_PREFIX,
};
use crate::remote_ptr::{RemotePtr, Void};
use crate::util::resize_shmem_segment;
use memoffset::offset_of;
use nix::sys::mman::{MapFlags, ProtFlags};
use std::cell::RefCell;
use std::ffi::CString;
use std::mem::size_of;
use std::rc::Rc;

fn init_buffers_arch<Arch: Architecture>(t: &mut Task, map_hint: RemotePtr<Void>) {
    // The tracee can't take a signal while it's processing the rtcall:
    // the preload library masks everything off around it.
    let mut remote = AutoRemoteSyscalls::new(t);

    let child_args: RemotePtr<rtcall_init_buffers_params<Arch::unsigned_word>> =
        RemotePtr::new(remote.initial_regs().arg1());
    let mut args = read_val_mem(remote.task_mut(), child_args, None);

    if remote.task().vm().syscallbuf_enabled() {
        init_syscall_buffer(&mut remote, map_hint);
        args.syscallbuf_ptr =
            Arch::usize_to_word(remote.task().syscallbuf_child.as_usize());
        let desched_fd = args.desched_counter_fd;
        remote.task_mut().desched_fd_child = desched_fd;
        // The child must not close this fd behind our back.
        remote
            .task()
            .fd_table()
            .add_monitor(desched_fd, Rc::new(RefCell::new(PreserveFileMonitor::new())));
    } else {
        args.syscallbuf_ptr = Arch::usize_to_word(0);
    }

    // Return the mapped buffer to the child.
    write_val_mem(remote.task_mut(), child_args, &args, None);

    // The child reads the address from the inout args block, but the
    // syscall-result slot lets replay cheaply assert it maps the segment
    // at the same place.
    let buf = remote.task().syscallbuf_child;
    remote.initial_regs_mut().set_syscall_result(buf.as_usize());
}

impl Task {
    /// Service an rtcall_init_buffers request from the preload library.
    /// `map_hint` is where the buffer is expected to land (asserted via
    /// MAP_FIXED) or null if there are no expectations (recording).
    pub fn init_buffers(&mut self, map_hint: RemotePtr<Void>) {
        let arch = self.arch();
        arch_function!(init_buffers_arch, arch, self, map_hint)
    }

    /// Service the rtcall_init_preload request: pick up the pointers the
    /// preload library advertises and tell it whether this is replay.
    pub fn at_preload_init(&mut self) {
        let arch = self.arch();
        arch_function!(do_preload_init_arch, arch, self);
        let fds = self.fd_table();
        fds.init_syscallbuf_fds_disabled(self);
    }

    /// Destroy in the tracee the scratch buffer and syscallbuf, if any.
    /// The task must be in a state where remote syscalls can run.
    pub fn destroy_buffers(&mut self) {
        let scratch_ptr = self.scratch_ptr;
        let scratch_size = self.scratch_size;
        let syscallbuf_child = self.syscallbuf_child;
        let num_syscallbuf_bytes = self.num_syscallbuf_bytes;
        let desched_fd_child = self.desched_fd_child;

        let is_recording = self.session().is_recording();
        {
            let mut remote = AutoRemoteSyscalls::new(self);
            let arch = remote.arch();
            if !scratch_ptr.is_null() {
                remote.infallible_syscall(
                    syscall_number_for_munmap(arch),
                    &[scratch_ptr.as_usize(), scratch_size],
                );
                remote.task().vm().unmap(scratch_ptr, scratch_size);
            }
            if !syscallbuf_child.is_null() {
                remote.infallible_syscall(
                    syscall_number_for_munmap(arch),
                    &[syscallbuf_child.as_usize(), num_syscallbuf_bytes],
                );
                remote
                    .task()
                    .vm()
                    .unmap(RemotePtr::cast(syscallbuf_child), num_syscallbuf_bytes);
                if desched_fd_child >= 0 {
                    if is_recording {
                        remote.infallible_syscall(
                            syscall_number_for_close(arch),
                            &[desched_fd_child as usize],
                        );
                    }
                    remote.task().fd_table().did_close(desched_fd_child);
                }
            }
        }
        self.scratch_ptr = RemotePtr::null();
        self.scratch_size = 0;
        self.destroy_local_buffers();
        self.syscallbuf_child = RemotePtr::null();
        self.num_syscallbuf_bytes = 0;
        self.desched_fd_child = -1;
    }

    /// Unmap the tracer-side view of the syscall buffer.
    pub(super) fn destroy_local_buffers(&mut self) {
        if !self.syscallbuf_hdr.is_null() {
            unsafe {
                libc::munmap(
                    self.syscallbuf_hdr as *mut libc::c_void,
                    self.num_syscallbuf_bytes,
                )
            };
            self.syscallbuf_hdr = std::ptr::null_mut();
        }
    }

    /// Bytes of live record data in the buffer, header included.
    pub fn syscallbuf_data_size(&self) -> usize {
        debug_assert!(!self.syscallbuf_hdr.is_null());
        let num_rec_bytes = unsafe { (*self.syscallbuf_hdr).num_rec_bytes };
        num_rec_bytes as usize + size_of::<syscallbuf_hdr>()
    }

    /// Zero out the recorded data and reset the header count. Makes
    /// checkpoint save/restore deterministic: only the recorded area is
    /// carried across.
    pub fn reset_syscallbuf(&mut self) {
        if self.syscallbuf_hdr.is_null() {
            return;
        }
        unsafe {
            let num_rec = (*self.syscallbuf_hdr).num_rec_bytes as usize;
            let data = (self.syscallbuf_hdr as *mut u8).add(size_of::<syscallbuf_hdr>());
            std::ptr::write_bytes(data, 0, num_rec);
            (*self.syscallbuf_hdr).num_rec_bytes = 0;
        }
    }

    /// Lock or unlock the tracee's buffer against use by the preload
    /// library. No effect until the buffer exists.
    pub fn set_syscallbuf_locked(&mut self, locked: bool) {
        if self.syscallbuf_child.is_null() {
            return;
        }
        let addr: RemotePtr<u8> =
            RemotePtr::new(self.syscallbuf_child.as_usize() + offset_of!(syscallbuf_hdr, locked));
        let value: u8 = if locked { 1 } else { 0 };
        write_val_mem(self, addr, &value, None);
    }
}

/// Create the shm segment shared with the tracee and map it in both
/// address spaces.
///
/// The tracee creates the backing file: handing it a tracer-created file
/// would require world-writable permissions for tracees in other user
/// namespaces, which would be a hole other users could abuse.
pub(super) fn init_syscall_buffer(
    remote: &mut AutoRemoteSyscalls,
    map_hint: RemotePtr<Void>,
) -> RemotePtr<Void> {
    let tid = remote.task().tid;
    let path = format!(
        "{}{}-{}",
        SYSCALLBUF_SHMEM_PATH_PREFIX,
        tid,
        rand::random::<u32>()
    );

    let arch = remote.arch();
    let child_shmem_fd;
    {
        let path_cstr = CString::new(path.clone()).unwrap();
        let mut child_path = AutoRestoreMem::push_cstr(remote, path_cstr.as_c_str());
        let addr = child_path.get().unwrap();
        // Skip the leading '/': the openat is relative to the reserved
        // root-dir fd.
        child_shmem_fd = child_path.infallible_syscall(
            syscall_number_for_openat(arch),
            &[
                RETRACE_RESERVED_ROOT_DIR_FD as usize,
                addr.as_usize() + 1,
                (libc::O_CREAT | libc::O_EXCL | libc::O_RDWR | libc::O_CLOEXEC) as usize,
                0o600,
            ],
        ) as i32;
    }

    // Remove the name immediately so no stale segment survives a crash.
    unsafe {
        let path_cstr = CString::new(path.clone()).unwrap();
        libc::unlink(path_cstr.as_ptr());
    }

    let shmem_fd = remote.retrieve_fd(child_shmem_fd);
    ed_assert!(remote.task(), shmem_fd.is_open());
    resize_shmem_segment(&shmem_fd, SYSCALLBUF_BUFFER_SIZE);
    log!(LogDebug, "created shmem segment {}", path);

    let num_syscallbuf_bytes = SYSCALLBUF_BUFFER_SIZE;
    let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
    let mut flags = MapFlags::MAP_SHARED;

    let map_addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            num_syscallbuf_bytes,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            shmem_fd.as_raw(),
            0,
        )
    };
    if map_addr == libc::MAP_FAILED {
        fatal!("Failed to mmap shmem region");
    }
    if !map_hint.is_null() {
        flags |= MapFlags::MAP_FIXED;
    }
    let child_map_addr =
        remote.infallible_mmap_syscall(map_hint, num_syscallbuf_bytes, prot, flags, child_shmem_fd, 0);

    {
        let t = remote.task_mut();
        ed_assert!(
            t,
            t.syscallbuf_child.is_null(),
            "Should not already have syscallbuf initialized!"
        );
        t.syscallbuf_child = RemotePtr::cast(child_map_addr);
        t.syscallbuf_hdr = map_addr as *mut syscallbuf_hdr;
        t.num_syscallbuf_bytes = num_syscallbuf_bytes;
        // No records to begin with.
        unsafe { std::ptr::write_bytes(t.syscallbuf_hdr as *mut u8, 0, size_of::<syscallbuf_hdr>()) };
    }

    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let fstat_ret = unsafe { libc::fstat(shmem_fd.as_raw(), &mut st) };
    ed_assert!(remote.task(), fstat_ret == 0);
    remote.task().vm().map(
        child_map_addr,
        num_syscallbuf_bytes,
        prot,
        flags,
        0,
        std::ffi::OsStr::new(&path),
        st.st_dev,
        st.st_ino,
    );

    drop(shmem_fd);
    remote.infallible_syscall(
        syscall_number_for_close(remote.arch()),
        &[child_shmem_fd as usize],
    );
    child_map_addr
}

fn do_preload_init_arch<Arch: Architecture>(t: &mut Task) {
    let params_addr: RemotePtr<rtcall_init_preload_params<Arch::unsigned_word>> =
        RemotePtr::new(t.regs_ref().arg1());
    let params = read_val_mem(t, params_addr, None);

    t.syscallbuf_fds_disabled_child =
        RemotePtr::new(Arch::word_to_usize(params.syscallbuf_fds_disabled));
    t.stopping_breakpoint_table =
        crate::remote_code_ptr::RemoteCodePtr::new(Arch::word_to_usize(params.breakpoint_table));
    t.stopping_breakpoint_table_entry_size = params.breakpoint_table_entry_size as usize;

    let in_replay: u8 = if t.session().is_replaying() { 1 } else { 0 };
    let flag_addr: RemotePtr<u8> = RemotePtr::new(Arch::word_to_usize(params.in_replay_flag));
    write_val_mem(t, flag_addr, &in_replay, None);
}
