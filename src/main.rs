use std::env;
use std::fs;
use std::sync::Arc;

use anyhow::{bail, Context};
use coldbrew::program::{ClassBuilder, MethodBuilder, ACC_PUBLIC, ACC_STATIC};
use coldbrew::{
    EngineConfig, InMemoryClassLibrary, Invocation, Jvm, Runtime, Value, VirtualMachineState,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    install_tracing();

    let config = match env::args().nth(1) {
        Some(path) => {
            let text = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            EngineConfig::from_json(&text)?
        }
        None => EngineConfig::default(),
    };

    let library = Arc::new(InMemoryClassLibrary::bootstrap()?);
    let factorial = library.register(factorial_class()?);
    let runtime = Runtime::new(Jvm::new(config)?.with_classes(library));
    let method = factorial
        .get_method("fact", "(I)I")
        .context("factorial class has no fact method")?;

    let mut state = VirtualMachineState::new();
    for n in [0, 5, 10, 12] {
        let args = vec![Value::Integer(n)];
        let invocation =
            runtime.execute_method(&mut state, Arc::clone(&factorial), Arc::clone(&method), args)?;
        match invocation {
            Invocation::Returned(Some(value)) => info!(n, result = ?value, "fact"),
            other => bail!("fact({n}) did not return a value: {other:?}"),
        }
    }
    info!(instructions = state.instructions_executed(), "done");
    Ok(())
}

// static int fact(int n) { return n <= 1 ? 1 : n * fact(n - 1); }
fn factorial_class() -> coldbrew::Result<coldbrew::program::Class> {
    let mut builder = ClassBuilder::new("Factorial");
    let [hi, lo] = builder.method_ref("Factorial", "fact", "(I)I").to_be_bytes();
    builder.method(
        MethodBuilder::new("fact", "(I)I")
            .access_flags(ACC_PUBLIC | ACC_STATIC)
            .code(vec![
                0x1a, 0x04, 0xa3, 0x00, 0x05, // iload_0, iconst_1, if_icmpgt +5
                0x04, 0xac, // iconst_1, ireturn
                0x1a, 0x1a, 0x04, 0x64, // iload_0, iload_0, iconst_1, isub
                0xb8, hi, lo, // invokestatic fact
                0x68, 0xac, // imul, ireturn
            ]),
    );
    builder.build()
}

fn install_tracing() {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Ok(directive) = "coldbrew=info".parse() {
        filter = filter.add_directive(directive);
    }
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
