// kernel/src/logging/serial.rs
//
// COM1 (0x3F8) への最小限のシリアル出力。
// - init(): 115200bps, 8N1 に初期化
// - write_str() / write_line(): 文字列を送信
//
// ロックは持たない（出力が多少混ざっても診断には足りる）。

use core::sync::atomic::{AtomicBool, Ordering};
use x86_64::instructions::port::Port;

const COM1: u16 = 0x3F8;

static SERIAL_INITIALIZED: AtomicBool = AtomicBool::new(false);

pub fn init() {
    if SERIAL_INITIALIZED.swap(true, Ordering::AcqRel) {
        return;
    }

    unsafe {
        let mut int_en = Port::<u8>::new(COM1 + 1);
        let mut line_ctrl = Port::<u8>::new(COM1 + 3);
        let mut div_low = Port::<u8>::new(COM1);
        let mut div_high = Port::<u8>::new(COM1 + 1);
        let mut fifo_ctrl = Port::<u8>::new(COM1 + 2);
        let mut modem_ctrl = Port::<u8>::new(COM1 + 4);

        int_en.write(0x00);

        // DLAB を立てて divisor = 1 (115200bps)
        line_ctrl.write(0x80);
        div_low.write(0x01);
        div_high.write(0x00);

        // 8N1
        line_ctrl.write(0x03);
        fifo_ctrl.write(0xC7);
        modem_ctrl.write(0x0B);
    }
}

fn write_byte(byte: u8) {
    unsafe {
        let mut line_status = Port::<u8>::new(COM1 + 5);
        let mut data = Port::<u8>::new(COM1);

        // 送信バッファが空くまで待つ
        while (line_status.read() & 0x20) == 0 {}

        data.write(byte);
    }
}

pub fn write_str(s: &str) {
    for b in s.bytes() {
        write_byte(b);
    }
}

pub fn write_line(s: &str) {
    write_str(s);
    write_str("\r\n");
}

pub fn write_prefixed_line(prefix: &str, msg: &str) {
    write_str(prefix);
    write_line(msg);
}
