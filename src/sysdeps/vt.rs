//! Virtual-terminal ioctls: kbd mode, VT mode, process-mode handshake.
//!
//! Lifted nearly verbatim from the `tty` ioctl module in
//! `backend/session/direct.rs` of the reference tree, which encodes the
//! same legacy VT kernel interface this daemon's Session VT handshake
//! (spec §4.2 "VT process-mode handshake") drives.

#![allow(non_upper_case_globals)]

use nix::libc::c_int;
use std::os::unix::io::RawFd;

nix::ioctl_read_bad!(kd_get_mode, 0x4B3B, i16);
nix::ioctl_write_int_bad!(kd_set_mode, 0x4B3A);
pub const KD_TEXT: i16 = 0x00;
pub const KD_GRAPHICS: i16 = 0x01;

nix::ioctl_read_bad!(kd_get_kb_mode, 0x4B44, i32);
nix::ioctl_write_int_bad!(kd_set_kb_mode, 0x4B45);
pub const K_OFF: i32 = 0x04;

nix::ioctl_write_int_bad!(vt_activate, 0x5606);
nix::ioctl_write_int_bad!(vt_wait_active, 0x5607);
nix::ioctl_write_ptr_bad!(vt_set_mode, 0x5602, VtMode);
nix::ioctl_write_int_bad!(vt_rel_disp, 0x5605);
nix::ioctl_read_bad!(vt_get_state, 0x5603, VtState);

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VtState {
    pub v_active: u16,
    pub v_signal: u16,
    pub v_state: u16,
}

/// The currently active VT number, as seen from any open tty/console fd.
pub fn active_vt(tty: RawFd) -> nix::Result<i32> {
    let mut state = VtState::default();
    unsafe { vt_get_state(tty, &mut state)? };
    Ok(state.v_active as i32)
}

pub const VT_AUTO: i8 = 0x00;
pub const VT_PROCESS: i8 = 0x01;
pub const VT_ACKACQ: i32 = 0x02;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VtMode {
    pub mode: i8,
    pub waitv: i8,
    pub relsig: i16,
    pub acqsig: i16,
    pub frsig: i16,
}

/// Saved keyboard/VT state so it can be restored on controller loss (spec
/// §4.2: "restore kbd mode, text mode, and auto VT-switch").
#[derive(Debug, Clone, Copy)]
pub struct SavedTtyState {
    pub kb_mode: i32,
}

/// Puts the kbd in `K_OFF`/raw mode and the VT in graphics mode, then
/// switches VT-switch ownership to process mode with `relsig` as the
/// release-request signal and `acqsig` as the acquire-ack signal.
///
/// The reference implementation reuses `SIGUSR1`/`SIGUSR2` for this, but
/// this daemon's CLI surface already gives `SIGUSR1` a different meaning
/// (runtime debug-log toggle), so the two real-time signals reserved for
/// the VT handshake are chosen by the caller instead.
pub fn enter_graphics_process_mode(tty: RawFd, relsig: i32, acqsig: i32) -> nix::Result<SavedTtyState> {
    let mut old_kb_mode = 0;
    unsafe {
        kd_get_kb_mode(tty, &mut old_kb_mode)?;
        kd_set_kb_mode(tty, K_OFF)?;
        kd_set_mode(tty, KD_GRAPHICS as c_int)?;
    }
    let mode = VtMode {
        mode: VT_PROCESS,
        relsig: relsig as i16,
        acqsig: acqsig as i16,
        ..Default::default()
    };
    unsafe {
        vt_set_mode(tty, &mode)?;
    }
    Ok(SavedTtyState { kb_mode: old_kb_mode })
}

/// Restores text mode, the saved kbd mode, and auto VT-switch ownership.
pub fn restore_text_auto_mode(tty: RawFd, saved: SavedTtyState) {
    unsafe {
        let _ = kd_set_kb_mode(tty, saved.kb_mode);
        let _ = kd_set_mode(tty, KD_TEXT as c_int);
        let _ = vt_set_mode(
            tty,
            &VtMode {
                mode: VT_AUTO,
                ..Default::default()
            },
        );
    }
}

/// Acks a VT_RELDISP release request (`arg=1`) or acquisition (`arg=VT_ACKACQ`).
pub fn ack_reldisp(tty: RawFd, arg: i32) -> nix::Result<()> {
    unsafe { vt_rel_disp(tty, arg) }.map(|_| ())
}

/// Requests a switch to `vt_num` and waits for the kernel to report it active.
pub fn activate_and_wait(tty: RawFd, vt_num: i32) -> nix::Result<()> {
    unsafe {
        vt_activate(tty, vt_num)?;
        vt_wait_active(tty, vt_num)?;
    }
    Ok(())
}
