fn main() {
    if let Err(err) = uroguardian_lib::run() {
        log::error!("UroGuardian exited with an error: {err:#}");
        eprintln!("uroguardian: {err:#}");
        std::process::exit(1);
    }
}
