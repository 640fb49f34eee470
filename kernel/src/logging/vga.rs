// kernel/src/logging/vga.rs
//
// VGA テキストモード(0xb8000)への最小限出力。
// - 最下行に書き、改行でスクロールする素朴な実装。
// - 高級なフォーマットや色付けは後回し。

use core::fmt::{self, Write};
use spin::Mutex;
use volatile::Volatile;

const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;

/// 文字色 | (背景色 << 4)
const COLOR_CODE: u8 = 0x07; // light gray on black

#[repr(C)]
#[derive(Clone, Copy)]
struct ScreenChar {
    ascii_character: u8,
    color_code: u8,
}

#[repr(transparent)]
struct Buffer {
    chars: [[Volatile<ScreenChar>; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

struct Writer {
    col: usize,
    buffer: &'static mut Buffer,
}

impl Writer {
    fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            byte => {
                if self.col >= BUFFER_WIDTH {
                    self.new_line();
                }
                let row = BUFFER_HEIGHT - 1;
                let col = self.col;
                self.buffer.chars[row][col].write(ScreenChar {
                    ascii_character: byte,
                    color_code: COLOR_CODE,
                });
                self.col += 1;
            }
        }
    }

    fn new_line(&mut self) {
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                let ch = self.buffer.chars[row][col].read();
                self.buffer.chars[row - 1][col].write(ch);
            }
        }
        self.clear_row(BUFFER_HEIGHT - 1);
        self.col = 0;
    }

    fn clear_row(&mut self, row: usize) {
        let blank = ScreenChar {
            ascii_character: b' ',
            color_code: COLOR_CODE,
        };
        for col in 0..BUFFER_WIDTH {
            self.buffer.chars[row][col].write(blank);
        }
    }
}

impl Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            self.write_byte(b);
        }
        Ok(())
    }
}

static WRITER: Mutex<Option<Writer>> = Mutex::new(None);

pub fn init() {
    let writer = Writer {
        col: 0,
        buffer: unsafe { &mut *(0xb8000 as *mut Buffer) },
    };
    *WRITER.lock() = Some(writer);
}

pub fn write_str(s: &str) {
    if let Some(ref mut w) = *WRITER.lock() {
        let _ = w.write_str(s);
    }
}

pub fn write_line(s: &str) {
    if let Some(ref mut w) = *WRITER.lock() {
        let _ = w.write_str(s);
        let _ = w.write_str("\n");
    }
}

pub fn write_prefixed_line(prefix: &str, msg: &str) {
    write_str(prefix);
    write_line(msg);
}
