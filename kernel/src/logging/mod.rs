// kernel/src/logging/mod.rs
//
// 役割:
// - カーネル全体の最小ロギング API（info / error / info_u64）を提供する。
//
// 設計方針:
// - heap 確保なし・format! なし（固定文字列 + u64 のみ）。
// - ターゲット上は VGA + COM1 の両方へ出す。
// - cfg(test) ではホストの stderr へ出す（0xb8000 や port I/O に触らない）。

#[cfg(not(test))]
mod vga;
#[cfg(not(test))]
mod serial;

#[cfg(not(test))]
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(not(test))]
static VGA_ENABLED: AtomicBool = AtomicBool::new(true);

#[cfg(not(test))]
pub fn init() {
    vga::init();
    serial::init();
}

#[cfg(test)]
pub fn init() {}

#[cfg(not(test))]
pub fn set_vga_enabled(enabled: bool) {
    VGA_ENABLED.store(enabled, Ordering::Relaxed);
}

#[cfg(not(test))]
fn emit(prefix: &str, msg: &str) {
    if VGA_ENABLED.load(Ordering::Relaxed) {
        vga::write_prefixed_line(prefix, msg);
    }
    serial::write_prefixed_line(prefix, msg);
}

#[cfg(test)]
fn emit(prefix: &str, msg: &str) {
    eprintln!("{}{}", prefix, msg);
}

pub fn info(msg: &str) {
    emit("[INFO] ", msg);
}

pub fn error(msg: &str) {
    emit("[ERROR] ", msg);
}

pub fn info_u64(label: &str, value: u64) {
    info_kv(label, value);
}

pub fn info_kv(key: &str, value: u64) {
    let mut buf = [0u8; 21];
    let s = u64_to_decimal(value, &mut buf);

    if key.is_empty() {
        emit_kv("[INFO] ", "", "", s);
        return;
    }

    emit_kv("[INFO] ", key, " = ", s);
}

pub fn error_kv(key: &str, value: u64) {
    let mut buf = [0u8; 21];
    let s = u64_to_decimal(value, &mut buf);
    emit_kv("[ERROR] ", key, " = ", s);
}

#[cfg(not(test))]
fn emit_kv(prefix: &str, key: &str, sep: &str, value: &str) {
    if VGA_ENABLED.load(Ordering::Relaxed) {
        vga::write_str(prefix);
        vga::write_str(key);
        vga::write_str(sep);
        vga::write_line(value);
    }

    serial::write_str(prefix);
    serial::write_str(key);
    serial::write_str(sep);
    serial::write_line(value);
}

#[cfg(test)]
fn emit_kv(prefix: &str, key: &str, sep: &str, value: &str) {
    eprintln!("{}{}{}{}", prefix, key, sep, value);
}

fn u64_to_decimal(mut value: u64, buf: &mut [u8; 21]) -> &str {
    if value == 0 {
        let last = buf.len() - 1;
        buf[last] = b'0';
        return unsafe { core::str::from_utf8_unchecked(&buf[last..]) };
    }

    let mut i = buf.len();
    while value > 0 {
        let digit = (value % 10) as u8;
        i -= 1;
        buf[i] = b'0' + digit;
        value /= 10;
    }

    unsafe { core::str::from_utf8_unchecked(&buf[i..]) }
}
