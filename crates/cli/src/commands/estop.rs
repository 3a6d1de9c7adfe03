//! `tether estop`: emergency stop for every running episode.

use tether_config::AppConfig;
use tether_security::KillSwitch;

pub async fn run(
    config: &AppConfig,
    resume: bool,
    reason: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let switch = KillSwitch::with_flag_file(config.estop_path());

    if resume {
        if switch.release()? {
            println!("✅ Emergency stop RELEASED: episodes may run again.");
        } else {
            println!("ℹ️  No emergency stop active.");
        }
    } else {
        switch.engage(reason.clone())?;
        println!("🛑 EMERGENCY STOP ENGAGED");
        println!("   Reason: {reason}");
        println!("   Running episodes are cancelled before their next tool call.");
        println!("   New tool invocations are denied by policy.");
        println!();
        println!("   To resume: tether estop --resume");
    }

    Ok(())
}
