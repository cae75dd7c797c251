//! Daemon invocation guard. The relay takes no CLI arguments; every runtime
//! knob is an environment key so a deployment can never drift from its .env.

pub fn ensure_env_only_invocation() -> anyhow::Result<()> {
    ensure_env_only_from_iter(std::env::args().skip(1))
}

fn ensure_env_only_from_iter<I, S>(args: I) -> anyhow::Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let supplied_args = args
        .into_iter()
        .map(|arg| arg.as_ref().to_string())
        .collect::<Vec<_>>();
    if !supplied_args.is_empty() {
        let joined = supplied_args.join(" ");
        return Err(anyhow::anyhow!(
            "CLI arguments are disabled for the relay daemon. Configure .env keys instead \
             (RELAY_API_KEY, RELAY_BIND_ADDR, ENCLAVE_ADDR, WORKER_CONCURRENCY, \
             SETTLEMENT_PERIOD). Received args: {}",
            joined
        ));
    }
    Ok(())
}
