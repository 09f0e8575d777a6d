// Binary entry point for ahma_sandbox
// This is a thin wrapper that delegates to the library implementation

#[tokio::main]
async fn main() {
    let code = match ahma_sandbox::shell::run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ahma_sandbox: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
