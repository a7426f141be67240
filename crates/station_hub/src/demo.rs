use std::{sync::Arc, time::Duration};

use shared::domain::{DialogRequest, ServerStatus, TestStatus};
use tokio::time::sleep;
use tracing::info;

use crate::hub::{DialogOutcome, OrchestratorHub};

/// Items exercised by the scripted run, in order.
pub const DEMO_ITEMS: [&str; 6] = [
    "emmc_test",
    "hdmi_capture_test",
    "hdmi_loop_test",
    "eth_download_test",
    "wifi_download_test",
    "download_test",
];

const CONFIRM_LABEL: &str = "Picture OK";
const REJECT_LABEL: &str = "No picture";

/// Walks one simulated unit through the station so consoles have something
/// to show: sidebar details, status transitions, terminal output and one
/// operator dialog.
pub async fn run_demo(hub: Arc<OrchestratorHub>, step: Duration) {
    hub.set_server_status(ServerStatus::Online);
    hub.set_machine_code("1");
    hub.set_current_device("demo-board-rev-b");
    hub.set_serial_number("SN-DEMO-000001");
    hub.set_target_ip("192.168.10.20");
    hub.reset_statuses(DEMO_ITEMS);

    for item in DEMO_ITEMS {
        hub.set_status(item, TestStatus::Testing);
        hub.terminal_write(format!("[{item}] started\n"));
        sleep(step).await;

        let status = if item == "hdmi_capture_test" {
            confirm_picture(&hub).await
        } else {
            TestStatus::Success
        };
        hub.terminal_write(format!("[{item}] {status}\n"));
        hub.set_status(item, status);
    }

    let uploads = hub.increment_upload_count();
    info!(uploads, "demo unit finished");
}

async fn confirm_picture(hub: &OrchestratorHub) -> TestStatus {
    let request = DialogRequest::new("Check the capture monitor.\nIs the HDMI test picture visible?")
        .primary_button(CONFIRM_LABEL)
        .button(REJECT_LABEL);
    match hub.show_dialog_and_wait(request).await {
        Ok(DialogOutcome::Chosen(label)) if label == CONFIRM_LABEL => TestStatus::Success,
        Ok(outcome) => {
            info!(?outcome, "operator rejected the picture");
            TestStatus::Failed
        }
        Err(error) => {
            info!(%error, "could not ask the operator");
            TestStatus::Failed
        }
    }
}
