//! Common test helpers: a scripted mock CPU, pool-backed kernel
//! environments and an in-memory extension ELF builder.
#![allow(dead_code)]

extern crate std;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use nanovisor_core::config::EXT_CODE_ADDR;
use nanovisor_core::ext::ExtPool;
use nanovisor_core::huge_pool::HugePool;
use nanovisor_core::page_pool::PagePool;
use nanovisor_core::root_page_table::RootPageTable;
use nanovisor_core::syscall::{dispatch_syscall, SyscallExit};
use nanovisor_core::vm::VmPool;
use nanovisor_core::vp::VpPool;
use nanovisor_core::vps::VpsPool;
use nanovisor_core::{Kernel, Tls};
use nanovisor_hal::abi::{
    BF_CALLBACK_OP_REGISTER_BOOTSTRAP_IDX_VAL, BF_CALLBACK_OP_REGISTER_FAIL_IDX_VAL,
    BF_CALLBACK_OP_REGISTER_VMEXIT_IDX_VAL, BF_CALLBACK_OP_VAL, BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL,
    BF_HANDLE_OP_VAL, BF_STATUS_SUCCESS,
};
use nanovisor_hal::intrinsic::{
    Intrinsic, IntrinsicError, MissingRegisters, Vendor, VmRunError,
};
use nanovisor_hal::state::StateSave;

/// What the mock records about one `call_ext`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtCall {
    pub ip: u64,
    pub sp: u64,
    pub arg0: u64,
    pub arg1: u64,
}

/// A scripted extension: runs inside `call_ext` with the caller's TLS
/// block, free to issue real syscalls through the dispatcher. Returning
/// `Ok` means control came back through the syscall layer; `Err` means
/// the "extension" returned or faulted.
pub type ExtProgram = Box<dyn FnMut(&mut Tls, ExtCall) -> Result<(), IntrinsicError> + Send>;

#[derive(Default)]
pub struct MockLog {
    pub msrs: HashMap<u32, u64>,
    pub vmcs: HashMap<(u64, u64), u64>,
    pub current_vmcs: Option<u64>,
    pub cr3_writes: Vec<u64>,
    pub tp_writes: Vec<u64>,
    pub vmclears: Vec<u64>,
    pub invvpids: Vec<(u64, u16, u64)>,
    pub invlpgas: Vec<(u64, u64)>,
    pub invepts: Vec<(u64, u64)>,
    pub runs: Vec<(u64, bool)>,
    pub run_results: VecDeque<Result<u64, VmRunError>>,
    pub ext_calls: Vec<ExtCall>,
    pub ext_call_results: VecDeque<Result<(), IntrinsicError>>,
    pub promotes: Vec<StateSave>,
}

/// Scripted in-memory CPU. VMCS fields live in a map keyed by the VMCS
/// physical address that was current at access time, which is exactly the
/// "loaded on one PP" discipline the kernel has to respect.
pub struct MockIntrinsic {
    vendor: Vendor,
    pub log: Mutex<MockLog>,
    program: Mutex<Option<ExtProgram>>,
}

impl MockIntrinsic {
    pub fn new() -> Self {
        Self::with_vendor(Vendor::Intel)
    }

    pub fn with_vendor(vendor: Vendor) -> Self {
        let mut log = MockLog::default();
        // IA32_VMX_BASIC: revision id 0x12
        log.msrs.insert(0x480, 0x12);
        Self { vendor, log: Mutex::new(log), program: Mutex::new(None) }
    }

    /// Installs the scripted extension `call_ext` hands control to.
    pub fn set_ext_program(
        &self,
        program: impl FnMut(&mut Tls, ExtCall) -> Result<(), IntrinsicError> + Send + 'static,
    ) {
        *self.program.lock().unwrap() = Some(Box::new(program));
    }

    pub fn set_msr(&self, msr: u32, val: u64) {
        self.log.lock().unwrap().msrs.insert(msr, val);
    }

    pub fn push_run_result(&self, result: Result<u64, VmRunError>) {
        self.log.lock().unwrap().run_results.push_back(result);
    }

    pub fn push_ext_call_result(&self, result: Result<(), IntrinsicError>) {
        self.log.lock().unwrap().ext_call_results.push_back(result);
    }

    /// Seeds a VMCS field for the structure at `phys`.
    pub fn seed_vmcs(&self, phys: u64, field: u64, val: u64) {
        self.log.lock().unwrap().vmcs.insert((phys, field), val);
    }
}

impl Intrinsic for MockIntrinsic {
    fn vendor(&self) -> Vendor {
        self.vendor
    }

    fn set_tp(&self, val: u64) {
        self.log.lock().unwrap().tp_writes.push(val);
    }

    fn set_cr3(&self, phys: u64) {
        self.log.lock().unwrap().cr3_writes.push(phys);
    }

    fn halt(&self) -> ! {
        panic!("halt() reached in a test");
    }

    fn rdmsr(&self, msr: u32) -> Result<u64, IntrinsicError> {
        Ok(*self.log.lock().unwrap().msrs.get(&msr).unwrap_or(&0))
    }

    fn wrmsr(&self, msr: u32, val: u64) -> Result<(), IntrinsicError> {
        self.log.lock().unwrap().msrs.insert(msr, val);
        Ok(())
    }

    fn invlpg(&self, _virt: u64) {}

    fn invlpga(&self, virt: u64, asid: u64) {
        self.log.lock().unwrap().invlpgas.push((virt, asid));
    }

    fn invept(&self, eptp: u64, kind: u64) {
        self.log.lock().unwrap().invepts.push((eptp, kind));
    }

    fn invvpid(&self, virt: u64, vpid: u16, kind: u64) {
        self.log.lock().unwrap().invvpids.push((virt, vpid, kind));
    }

    fn vmclear(&self, phys: u64) -> Result<(), IntrinsicError> {
        let mut log = self.log.lock().unwrap();
        log.vmclears.push(phys);
        if log.current_vmcs == Some(phys) {
            log.current_vmcs = None;
        }
        Ok(())
    }

    fn vmload(&self, phys: u64) -> Result<(), IntrinsicError> {
        self.log.lock().unwrap().current_vmcs = Some(phys);
        Ok(())
    }

    fn vmread16(&self, field: u64) -> Result<u16, IntrinsicError> {
        self.vmread64(field).map(|v| v as u16)
    }

    fn vmread32(&self, field: u64) -> Result<u32, IntrinsicError> {
        self.vmread64(field).map(|v| v as u32)
    }

    fn vmread64(&self, field: u64) -> Result<u64, IntrinsicError> {
        let log = self.log.lock().unwrap();
        let current = log.current_vmcs.ok_or(IntrinsicError::VmxFailInvalid)?;
        Ok(*log.vmcs.get(&(current, field)).unwrap_or(&0))
    }

    fn vmwrite16(&self, field: u64, val: u16) -> Result<(), IntrinsicError> {
        self.vmwrite64(field, u64::from(val))
    }

    fn vmwrite32(&self, field: u64, val: u32) -> Result<(), IntrinsicError> {
        self.vmwrite64(field, u64::from(val))
    }

    fn vmwrite64(&self, field: u64, val: u64) -> Result<(), IntrinsicError> {
        let mut log = self.log.lock().unwrap();
        let current = log.current_vmcs.ok_or(IntrinsicError::VmxFailInvalid)?;
        log.vmcs.insert((current, field), val);
        Ok(())
    }

    fn vm_run(
        &self,
        _regs: &mut MissingRegisters,
        hw_phys: u64,
        launched: bool,
    ) -> Result<u64, VmRunError> {
        let mut log = self.log.lock().unwrap();
        log.runs.push((hw_phys, launched));
        log.run_results.pop_front().unwrap_or(Err(VmRunError::InvalidState))
    }

    fn call_ext(
        &self,
        tls: &mut Tls,
        ip: u64,
        arg0: u64,
        arg1: u64,
    ) -> Result<(), IntrinsicError> {
        let call = ExtCall { ip, sp: tls.sp, arg0, arg1 };
        self.log.lock().unwrap().ext_calls.push(call);

        // take the program out while it runs so an accidental nested
        // call falls back to the scripted results
        let program = self.program.lock().unwrap().take();
        if let Some(mut program) = program {
            let result = program(tls, call);
            *self.program.lock().unwrap() = Some(program);
            return result;
        }

        self.log.lock().unwrap().ext_call_results.pop_front().unwrap_or(Ok(()))
    }

    fn promote(&self, state: &StateSave) {
        self.log.lock().unwrap().promotes.push(*state);
    }
}

// -------------------------------------------------------------------------
// test environment
// -------------------------------------------------------------------------

pub const TEST_ONLINE_PPS: u16 = 2;
pub const PAGE_POOL_BYTES: usize = 8 * 1024 * 1024;
pub const HUGE_POOL_BYTES: usize = 1024 * 1024;
pub const PAGE_POOL_PHYS: u64 = 0x1000_0000;
pub const HUGE_POOL_PHYS: u64 = 0x3000_0000;

fn leak_pool_memory(bytes: usize) -> *mut u8 {
    let layout = std::alloc::Layout::from_size_align(bytes, 4096).unwrap();
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!ptr.is_null());
    ptr
}

/// Everything a test needs to drive the kernel in-process.
pub struct TestEnv {
    pub intrinsic: MockIntrinsic,
    pub page_pool: PagePool,
    pub huge_pool: HugePool,
    pub system_rpt: RootPageTable,
    pub vm_pool: VmPool,
    pub vp_pool: VpPool,
    pub vps_pool: VpsPool,
    pub ext_pool: ExtPool,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_vendor(Vendor::Intel)
    }

    /// An environment whose pools and system RPT are still untouched, for
    /// driving the boot path itself.
    pub fn bare() -> Self {
        Self {
            intrinsic: MockIntrinsic::new(),
            page_pool: PagePool::new(),
            huge_pool: HugePool::new(),
            system_rpt: RootPageTable::new(),
            vm_pool: VmPool::new(),
            vp_pool: VpPool::new(),
            vps_pool: VpsPool::new(),
            ext_pool: ExtPool::new(),
        }
    }

    pub fn with_vendor(vendor: Vendor) -> Self {
        let mut env = Self::bare();
        env.intrinsic = MockIntrinsic::with_vendor(vendor);

        unsafe {
            env.page_pool
                .initialize(leak_pool_memory(PAGE_POOL_BYTES), PAGE_POOL_PHYS, PAGE_POOL_BYTES)
                .unwrap();
            env.huge_pool
                .initialize(leak_pool_memory(HUGE_POOL_BYTES), HUGE_POOL_PHYS, HUGE_POOL_BYTES)
                .unwrap();
        }

        env.system_rpt.initialize(&env.page_pool).unwrap();
        env
    }

    pub fn kernel(&self) -> Kernel<'_> {
        Kernel {
            intrinsic: &self.intrinsic,
            page_pool: &self.page_pool,
            huge_pool: &self.huge_pool,
            system_rpt: &self.system_rpt,
            vm_pool: &self.vm_pool,
            vp_pool: &self.vp_pool,
            vps_pool: &self.vps_pool,
            ext_pool: &self.ext_pool,
        }
    }

    pub fn tls(&self, ppid: u16) -> Tls {
        let mut tls = Tls::new(ppid, TEST_ONLINE_PPS);
        tls.root_vp_state = Box::leak(Box::new(StateSave::default()));
        tls
    }

    /// Brings the environment to the state right after boot: extension
    /// loaded and started, root VM active on PP 0, handle opened and all
    /// three callbacks registered. Returns the PP 0 TLS block; the handle
    /// is in `ext_reg0`.
    pub fn booted() -> (Self, Tls) {
        let env = Self::new();
        let elf = ElfBuilder::new().build();

        let mut tls = env.tls(0);
        env.ext_pool
            .initialize(&tls, &env.page_pool, &env.huge_pool, &env.system_rpt, &[&elf])
            .unwrap();

        let root_vmid = env.vm_pool.allocate().unwrap();
        assert_eq!(root_vmid, 0);
        env.vm_pool.set_active(&mut tls, root_vmid).unwrap();

        env.ext_pool.start(&mut tls, &env.intrinsic).unwrap();
        tls.active_extid = 0;

        // what the extension's _start would do
        let handle = {
            let k = env.kernel();
            let exit = syscall(&k, &mut tls, BF_HANDLE_OP_VAL | BF_HANDLE_OP_OPEN_HANDLE_IDX_VAL, 1, 0, 0);
            assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));
            tls.ext_reg0
        };

        for (idx, ip) in [
            (BF_CALLBACK_OP_REGISTER_BOOTSTRAP_IDX_VAL, EXT_CODE_ADDR + 0x100),
            (BF_CALLBACK_OP_REGISTER_VMEXIT_IDX_VAL, EXT_CODE_ADDR + 0x200),
            (BF_CALLBACK_OP_REGISTER_FAIL_IDX_VAL, EXT_CODE_ADDR + 0x300),
        ] {
            let k = env.kernel();
            tls.ext_reg0 = handle;
            let exit = syscall(&k, &mut tls, BF_CALLBACK_OP_VAL | idx, ip, 0, 0);
            assert_eq!(exit, SyscallExit::Return(BF_STATUS_SUCCESS));
        }

        tls.ext_reg0 = handle;
        (env, tls)
    }
}

/// Issues one syscall the way the platform stub would: spill the opcode
/// word and arguments, dispatch. `ext_reg0` is left as the caller set it
/// (it carries the handle in).
pub fn syscall(k: &Kernel<'_>, tls: &mut Tls, opcode: u64, reg1: u64, reg2: u64, reg3: u64) -> SyscallExit {
    tls.ext_syscall = opcode;
    tls.ext_reg1 = reg1;
    tls.ext_reg2 = reg2;
    tls.ext_reg3 = reg3;
    dispatch_syscall(k, tls)
}

// -------------------------------------------------------------------------
// ELF image builder
// -------------------------------------------------------------------------

const PT_LOAD: u32 = 1;
const PT_TLS: u32 = 7;
const PT_GNU_STACK: u32 = 0x6474_E551;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

struct Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

/// Builds small, valid (or deliberately broken) extension images.
pub struct ElfBuilder {
    pub entry: u64,
    pub exec_stack: bool,
    pub omit_gnu_stack: bool,
    pub second_rx: bool,
    pub with_tls: bool,
    pub extra_section: Option<&'static str>,
    pub relocations: Vec<(u64, u64)>,
    pub rela_type: u32,
    pub rx_payload: Vec<u8>,
    pub rw_payload: Vec<u8>,
}

impl ElfBuilder {
    pub fn new() -> Self {
        Self {
            entry: EXT_CODE_ADDR + 0x10,
            exec_stack: false,
            omit_gnu_stack: false,
            second_rx: false,
            with_tls: false,
            extra_section: None,
            relocations: Vec::new(),
            rela_type: 8, // R_X86_64_RELATIVE
            rx_payload: vec![0x90; 0x200],
            rw_payload: vec![0xAB; 0x100],
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let mut phdrs = vec![
            Phdr {
                p_type: PT_LOAD,
                p_flags: PF_R | PF_X,
                p_offset: 0x1000,
                p_vaddr: EXT_CODE_ADDR,
                p_filesz: self.rx_payload.len() as u64,
                p_memsz: self.rx_payload.len() as u64,
                p_align: 4096,
            },
            Phdr {
                p_type: PT_LOAD,
                p_flags: PF_R | PF_W,
                p_offset: 0x2000,
                p_vaddr: EXT_CODE_ADDR + 0x10000,
                p_filesz: self.rw_payload.len() as u64,
                p_memsz: self.rw_payload.len() as u64 + 0x80,
                p_align: 4096,
            },
        ];

        if !self.omit_gnu_stack {
            phdrs.push(Phdr {
                p_type: PT_GNU_STACK,
                p_flags: if self.exec_stack { PF_R | PF_W | PF_X } else { PF_R | PF_W },
                p_offset: 0,
                p_vaddr: 0,
                p_filesz: 0,
                p_memsz: 0,
                p_align: 0,
            });
        }

        if self.second_rx {
            phdrs.push(Phdr {
                p_type: PT_LOAD,
                p_flags: PF_R | PF_X,
                p_offset: 0x1000,
                p_vaddr: EXT_CODE_ADDR + 0x20000,
                p_filesz: 0x100,
                p_memsz: 0x100,
                p_align: 4096,
            });
        }

        if self.with_tls {
            phdrs.push(Phdr {
                p_type: PT_TLS,
                p_flags: PF_R,
                p_offset: 0x2000,
                p_vaddr: EXT_CODE_ADDR + 0x10000,
                p_filesz: 0x40,
                p_memsz: 0x80,
                p_align: 8,
            });
        }

        // string table: "\0.shstrtab\0.eh_frame\0<extra>\0"
        let mut shstrtab = vec![0u8];
        let shstrtab_name_off = shstrtab.len() as u32;
        shstrtab.extend_from_slice(b".shstrtab\0");
        let extra_name_off = shstrtab.len() as u32;
        if let Some(name) = self.extra_section {
            shstrtab.extend_from_slice(name.as_bytes());
            shstrtab.push(0);
        }

        let rela_bytes: Vec<u8> = self
            .relocations
            .iter()
            .flat_map(|&(offset, addend)| {
                let mut entry = Vec::new();
                entry.extend_from_slice(&offset.to_le_bytes());
                entry.extend_from_slice(&u64::from(self.rela_type).to_le_bytes());
                entry.extend_from_slice(&addend.to_le_bytes());
                entry
            })
            .collect();

        // file layout: ehdr | phdrs | rx @ 0x1000 | rw @ 0x2000 |
        // shstrtab @ 0x3000 | rela @ 0x3800 | shdrs @ 0x4000
        let mut file = vec![0u8; 0x5000];

        // ELF header
        file[0..4].copy_from_slice(b"\x7FELF");
        file[4] = 2; // ELFCLASS64
        file[5] = 1; // ELFDATA2LSB
        file[6] = 1; // EV_CURRENT
        file[7] = 0; // ELFOSABI_SYSV
        put_u16(&mut file, 16, 3); // ET_DYN
        put_u16(&mut file, 18, 62); // EM_X86_64
        put_u32(&mut file, 20, 1); // e_version
        put_u64(&mut file, 24, self.entry);
        put_u64(&mut file, 32, 64); // e_phoff
        put_u64(&mut file, 40, 0x4000); // e_shoff
        put_u32(&mut file, 48, 0); // e_flags
        put_u16(&mut file, 52, 64); // e_ehsize
        put_u16(&mut file, 54, 56); // e_phentsize
        put_u16(&mut file, 56, phdrs.len() as u16);
        put_u16(&mut file, 58, 64); // e_shentsize

        for (i, phdr) in phdrs.iter().enumerate() {
            let base = 64 + i * 56;
            put_u32(&mut file, base, phdr.p_type);
            put_u32(&mut file, base + 4, phdr.p_flags);
            put_u64(&mut file, base + 8, phdr.p_offset);
            put_u64(&mut file, base + 16, phdr.p_vaddr);
            put_u64(&mut file, base + 24, phdr.p_vaddr);
            put_u64(&mut file, base + 32, phdr.p_filesz);
            put_u64(&mut file, base + 40, phdr.p_memsz);
            put_u64(&mut file, base + 48, phdr.p_align);
        }

        file[0x1000..0x1000 + self.rx_payload.len()].copy_from_slice(&self.rx_payload);
        file[0x2000..0x2000 + self.rw_payload.len()].copy_from_slice(&self.rw_payload);
        file[0x3000..0x3000 + shstrtab.len()].copy_from_slice(&shstrtab);
        file[0x3800..0x3800 + rela_bytes.len()].copy_from_slice(&rela_bytes);

        // sections: null, .shstrtab, optional extra, optional rela
        let mut shnum = 2;
        let shdr = |file: &mut Vec<u8>, i: usize, name: u32, sh_type: u32, off: u64, size: u64, entsize: u64| {
            let base = 0x4000 + i * 64;
            put_u32(file, base, name);
            put_u32(file, base + 4, sh_type);
            put_u64(file, base + 24, off);
            put_u64(file, base + 32, size);
            put_u64(file, base + 56, entsize);
        };

        shdr(&mut file, 1, shstrtab_name_off, 3, 0x3000, shstrtab.len() as u64, 0);

        if self.extra_section.is_some() {
            shdr(&mut file, shnum, extra_name_off, 1, 0, 0, 0);
            shnum += 1;
        }

        if !self.relocations.is_empty() {
            shdr(&mut file, shnum, 0, 4, 0x3800, rela_bytes.len() as u64, 24);
            shnum += 1;
        }

        put_u16(&mut file, 60, shnum as u16);
        put_u16(&mut file, 62, 1); // e_shstrndx

        file
    }
}

fn put_u16(buf: &mut [u8], off: usize, val: u16) {
    buf[off..off + 2].copy_from_slice(&val.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, val: u64) {
    buf[off..off + 8].copy_from_slice(&val.to_le_bytes());
}
