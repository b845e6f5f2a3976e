use std::env;
use std::time::Instant;

use nix::libc::user_regs_struct;
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tracesym::{PtraceContext, Resolution, MODULE_SIGNATURE};

// instruction_pointer() below only knows these register layouts.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("tracesym reads the instruction pointer on x86_64 and aarch64 only");

#[cfg(target_arch = "x86_64")]
fn instruction_pointer(regs: &user_regs_struct) -> u64 {
    regs.rip
}

#[cfg(target_arch = "aarch64")]
fn instruction_pointer(regs: &user_regs_struct) -> u64 {
    regs.pc
}

fn parse_address(arg: &str) -> Result<u64, std::num::ParseIntError> {
    let digits = arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")).unwrap_or(arg);
    u64::from_str_radix(digits, 16)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_resolution(res: &Resolution<'_>) {
    print!("  0x{:016x}", res.address);
    match (res.mapping, res.symbol) {
        (None, _) => print!(" <unmapped>"),
        (Some(mapping), symbol) => {
            if let Some(symbol) = symbol {
                print!(" in {}+0x{:x}", symbol.name, res.symbol_offset().unwrap_or(0));
            }
            let path = if mapping.is_anonymous() { "[anonymous]" } else { mapping.pathname.as_str() };
            print!(" ({path} +0x{:x})", res.address - mapping.start);
        }
    }
    println!();
}

fn display_modules(ctx: &PtraceContext) {
    println!("\n=== Memory Maps ===");
    println!("Address Range                     Perms  Offset    Syms  Pathname");
    for (index, mapping) in ctx.mappings().iter().enumerate() {
        let perms = format!(
            "{}{}{}",
            if mapping.readable { 'r' } else { '-' },
            if mapping.writable { 'w' } else { '-' },
            if mapping.executable { 'x' } else { '-' },
        );
        let syms = match ctx.module(index) {
            Some(module) => match &module.symbols {
                Some(table) => table.len().to_string(),
                None => "-".to_owned(),
            },
            None => String::new(),
        };
        println!(
            "{:016x}-{:016x} {:5}  {:08x}  {:>5} {}",
            mapping.start,
            mapping.end,
            perms,
            mapping.offset,
            syms,
            if mapping.is_anonymous() { "[anonymous]" } else { mapping.pathname.as_str() }
        );
    }
}

fn attach(pid: Pid) -> Result<(), Box<dyn std::error::Error>> {
    ptrace::attach(pid)?;
    match waitpid(pid, None)? {
        WaitStatus::Stopped(_, _) => Ok(()),
        status => Err(format!("unexpected wait status for {pid}: {status:?}").into()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <pid> [address ...]", args[0]);
        std::process::exit(1);
    }

    let pid = Pid::from_raw(args[1].parse()?);
    let mut addresses = args[2..]
        .iter()
        .map(|a| parse_address(a))
        .collect::<Result<Vec<_>, _>>()?;

    info!(
        "tracesym {} ({}), module signature 0x{:08x}",
        env!("CARGO_PKG_VERSION"),
        env::consts::ARCH,
        MODULE_SIGNATURE
    );
    info!("attaching to process {pid}");

    let start_time = Instant::now();
    attach(pid)?;

    let result = (|| -> Result<(), Box<dyn std::error::Error>> {
        if addresses.is_empty() {
            addresses.push(instruction_pointer(&ptrace::getregs(pid)?));
        }

        let ctx = PtraceContext::build(pid)?;
        info!("context built in {:?}", start_time.elapsed());

        println!("=== Process {pid} ===");
        for &address in &addresses {
            print_resolution(&ctx.resolve(address));
        }
        display_modules(&ctx);

        ctx.destroy();
        Ok(())
    })();

    if let Err(e) = ptrace::detach(pid, None) {
        warn!("failed to detach from {pid}: {e}");
    }
    info!("process was stopped for {:?}", start_time.elapsed());

    result
}
