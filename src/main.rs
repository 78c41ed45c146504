//! Binary entry point for `yubi-oath-vpn`.

#[tokio::main]
async fn main() {
    std::process::exit(yubi_oath_vpn::run().await);
}
