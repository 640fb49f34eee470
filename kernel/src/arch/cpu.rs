// kernel/src/arch/cpu.rs
//
// CPU 命令ラッパ。unsafe は最小限。
//
// コアローカルベースポインタ:
// - 実機では GS base MSR に CoreLocal のアドレスを入れる。
// - ホストテストでは MSR が使えないので thread_local に差し替える
//   （テストスレッド = 1 コアという見立て）。
// - 利用側（kernel::core_local）は install_core_base / core_base しか見ない。

#[cfg(not(test))]
pub fn halt_loop() -> ! {
    loop {
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
        }
    }
}

/// このコアの CoreLocal のアドレスを登録する。
#[cfg(not(test))]
pub fn install_core_base(addr: u64) {
    use x86_64::registers::model_specific::GsBase;
    GsBase::write(x86_64::VirtAddr::new(addr));
}

/// 登録済みの CoreLocal のアドレス（未登録なら 0）。
#[cfg(not(test))]
pub fn core_base() -> u64 {
    use x86_64::registers::model_specific::GsBase;
    GsBase::read().as_u64()
}


#[cfg(test)]
pub fn install_core_base(addr: u64) {
    host::CORE_BASE.with(|b| b.set(addr));
}

#[cfg(test)]
pub fn core_base() -> u64 {
    host::CORE_BASE.with(|b| b.get())
}
