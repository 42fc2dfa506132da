//! 集成测试 - 链路层场景
//!
//! 通过公开 API 驱动内存中的 MockPeripheral，验证请求 / 响应、长脚本回退、
//! 命令串行化、helper 注入幂等和 DFU 校验。

use std::sync::Arc;
use std::time::Duration;

use framelink_core::mock::{MockConnector, MockEvent, MockPeripheral};
use framelink_core::{
    CommandChannel, ConnectOutcome, Connection, Connector, DfuClient, Endpoint, FrameError,
    FramePrefix, HelperInjection, LinkSettings, LinkState, Profile, ScannedDevice, ScriptOptions,
    Transport,
};
use futures_util::StreamExt;

fn settings() -> LinkSettings {
    LinkSettings {
        connect_timeout: Duration::from_secs(1),
        default_timeout: Duration::from_secs(2),
        ..LinkSettings::default()
    }
}

async fn connected_with(mock: &MockPeripheral, settings: LinkSettings) -> CommandChannel {
    let conn = Arc::new(Connection::new(mock.connector(), settings));
    let channel = CommandChannel::new(conn);
    assert!(channel.connect(Duration::from_secs(1)).await.unwrap());
    channel
}

async fn connected(mock: &MockPeripheral) -> CommandChannel {
    connected_with(mock, settings()).await
}

fn write_position(events: &[MockEvent], needle: &str) -> Option<usize> {
    events.iter().position(|event| match event {
        MockEvent::Write {
            endpoint: Endpoint::Tx,
            data,
        } => String::from_utf8_lossy(data).contains(needle),
        _ => false,
    })
}

#[tokio::test(start_paused = true)]
async fn test_simple_echo() {
    let mock = MockPeripheral::new();
    let channel = connected(&mock).await;
    assert!(channel.helpers_loaded());

    let reply = channel
        .run_script("print(\"hello\")", ScriptOptions::printed())
        .await
        .unwrap();
    assert_eq!(reply.as_deref(), Some("hello"));
    assert_eq!(
        mock.tx_strings().last().map(String::as_str),
        Some("prntLng(\"hello\")")
    );

    let reply = channel
        .run_script("print('hi')", ScriptOptions::printed())
        .await
        .unwrap();
    assert_eq!(reply.as_deref(), Some("hi"));
}

#[tokio::test(start_paused = true)]
async fn test_bypass_helpers_keeps_print() {
    let mock = MockPeripheral::new();
    let channel = connected(&mock).await;

    let reply = channel
        .run_script(
            "  print(42)\n",
            ScriptOptions::printed().bypassing_helpers(),
        )
        .await
        .unwrap();
    assert_eq!(reply.as_deref(), Some("42"));
    assert_eq!(mock.tx_strings().last().map(String::as_str), Some("print(42)"));
}

#[tokio::test(start_paused = true)]
async fn test_checked_script_waits_for_ack() {
    let mock = MockPeripheral::new();
    let channel = connected(&mock).await;

    let reply = channel
        .run_script("x=1", ScriptOptions::checked())
        .await
        .unwrap();
    assert_eq!(reply, None);
    let last = mock.tx_strings().pop().unwrap();
    assert!(last.starts_with("x=1;print(\"+"), "{last}");
}

#[tokio::test(start_paused = true)]
async fn test_fire_and_forget() {
    let mock = MockPeripheral::new();
    let channel = connected(&mock).await;
    mock.clear_events();

    let reply = channel
        .run_script("frame.display.show()", ScriptOptions::default())
        .await
        .unwrap();
    assert_eq!(reply, None);
    assert_eq!(mock.tx_strings(), vec!["frame.display.show()".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_peripheral_error_is_reported() {
    let mock = MockPeripheral::new();
    let channel = connected(&mock).await;

    let checked = channel
        .run_script("error(\"boom\")", ScriptOptions::checked())
        .await;
    assert!(matches!(checked, Err(FrameError::PeripheralScript(ref m)) if m.contains("boom")));

    let printed = channel
        .run_script("error(\"bad\")", ScriptOptions::printed())
        .await;
    assert!(matches!(printed, Err(FrameError::PeripheralScript(_))));
}

#[tokio::test(start_paused = true)]
async fn test_silent_script_times_out() {
    let mock = MockPeripheral::new();
    let channel = connected(&mock).await;

    let result = channel
        .run_script(
            "x=1",
            ScriptOptions::printed().with_timeout(Duration::from_millis(300)),
        )
        .await;
    assert!(matches!(result, Err(FrameError::Timeout { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_long_script_uses_file_and_require() {
    let mock = MockPeripheral::new().with_max_length(180);
    let channel = connected(&mock).await;
    assert_eq!(channel.connection().limits().max_string, 180);
    mock.clear_events();

    let mut code = String::new();
    let mut i = 0;
    while code.len() < 5000 {
        code.push_str(&format!("local v{i}={i}\n"));
        i += 1;
    }
    code.push_str("print(\"done\")");
    assert!(code.len() > 5000);

    let reply = channel
        .run_script(&code, ScriptOptions::printed())
        .await
        .unwrap();
    assert_eq!(reply.as_deref(), Some("done"));

    let sent = mock.tx_strings();
    assert!(sent.iter().all(|s| s.len() <= 180));
    assert!(!sent.iter().any(|s| s.starts_with("local v0=0")));

    let events = mock.events();
    let open = write_position(&events, "w=frame.file.open(\"/tmp").unwrap();
    let first_chunk = write_position(&events, "w:write(").unwrap();
    let close = write_position(&events, "w:close()").unwrap();
    let require = write_position(&events, "require(\"tmp").unwrap();
    let remove = write_position(&events, "frame.file.remove(\"/tmp").unwrap();
    assert!(open < first_chunk && first_chunk < close && close < require && require < remove);

    assert!(!mock.file_names().iter().any(|name| name.starts_with("/tmp")));
}

#[tokio::test(start_paused = true)]
async fn test_long_script_checked_uses_require_nonce() {
    let mock = MockPeripheral::new();
    let channel = connected(&mock).await;

    let code = "x=1\n".repeat(100);
    channel
        .send_long_script(&code, ScriptOptions::checked())
        .await
        .unwrap();
    assert!(
        mock.tx_strings()
            .iter()
            .any(|s| s.starts_with("require(\"tmp") && s.contains(";print(\">"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_script_beyond_file_limit_is_rejected() {
    let mock = MockPeripheral::new();
    let channel = connected_with(
        &mock,
        LinkSettings {
            inject_helpers: false,
            max_file_size: 1000,
            ..settings()
        },
    )
    .await;

    let code = "x=1\n".repeat(500);
    let result = channel.run_script(&code, ScriptOptions::checked()).await;
    assert!(matches!(
        result,
        Err(FrameError::PayloadTooLarge { limit: 1000, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_outstanding_command() {
    let mock = MockPeripheral::new().with_response_delay(Duration::from_millis(50));
    let channel = connected(&mock).await;
    mock.clear_events();

    let (a, b) = tokio::join!(
        channel.run_script("a=1", ScriptOptions::checked()),
        channel.run_script("b=2", ScriptOptions::checked()),
    );
    a.unwrap();
    b.unwrap();

    let events = mock.events();
    let first = write_position(&events, "a=1;print(").unwrap();
    let second = write_position(&events, "b=2;print(").unwrap();
    let (earlier, later) = (first.min(second), first.max(second));
    assert!(
        events[earlier..later]
            .iter()
            .any(|event| matches!(event, MockEvent::Notify { .. })),
        "second script was written before the first one was answered"
    );
}

#[tokio::test(start_paused = true)]
async fn test_helper_injection_is_idempotent() {
    let mock = MockPeripheral::new();
    let channel = connected(&mock).await;
    assert!(mock.has_function("prntLng"));

    let count_chunks = |mock: &MockPeripheral| {
        mock.tx_strings()
            .iter()
            .filter(|s| s.starts_with("w:write("))
            .count()
    };
    let written = count_chunks(&mock);
    assert!(written > 0);

    assert_eq!(
        channel.inject_helpers().await.unwrap(),
        HelperInjection::AlreadyLoaded
    );
    assert_eq!(count_chunks(&mock), written);

    // 外设内存被清空，但文件仍在
    mock.forget_functions();
    assert_eq!(
        channel.inject_helpers().await.unwrap(),
        HelperInjection::LoadedFromFile
    );
    assert_eq!(count_chunks(&mock), written);
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_sequence() {
    let mock = MockPeripheral::new().with_max_length(200);
    let channel = connected(&mock).await;

    let writes = mock.writes();
    assert_eq!(writes[0], (Endpoint::Tx, vec![0x03]));

    let sent = mock.tx_strings();
    assert_eq!(sent[0], "print(frame.bluetooth.max_length())");
    assert!(sent.iter().any(|s| s.starts_with("frame.time.utc(")));
    assert!(sent.last().unwrap().starts_with("is_awake=true;print(\"+"));
    assert_eq!(channel.connection().limits().max_string, 200);
    assert_eq!(channel.connection().state(), LinkState::Connected);

    // 已连接时再次 connect 不会重复初始化
    assert!(channel.connect(Duration::from_secs(1)).await.unwrap());
    assert_eq!(mock.connect_count(), 1);
    assert_eq!(mock.tx_strings().len(), sent.len());
}

#[tokio::test(start_paused = true)]
async fn test_not_connected_without_auto_reconnect() {
    let mock = MockPeripheral::new();
    let conn = Arc::new(Connection::new(
        mock.connector(),
        LinkSettings {
            auto_reconnect: false,
            ..settings()
        },
    ));
    let channel = CommandChannel::new(conn);
    let result = channel.run_script("x=1", ScriptOptions::checked()).await;
    assert!(matches!(result, Err(FrameError::NotConnected)));
    assert_eq!(mock.connect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_script_connects_on_demand() {
    let mock = MockPeripheral::new();
    let channel = CommandChannel::new(Arc::new(Connection::new(mock.connector(), settings())));

    let reply = channel
        .run_script("print(\"up\")", ScriptOptions::printed())
        .await
        .unwrap();
    assert_eq!(reply.as_deref(), Some("up"));
    assert_eq!(mock.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_reports_missing_device() {
    let mock = MockPeripheral::new();
    mock.set_available(false);
    let channel = CommandChannel::new(Arc::new(Connection::new(mock.connector(), settings())));

    assert!(!channel.connect(Duration::from_millis(200)).await.unwrap());
    let result = channel.ensure_connected().await;
    assert!(matches!(
        result,
        Err(FrameError::ConnectFailed { attempts: 2, .. })
    ));
}

/// 按 ID 重连总是耗尽给定时间，扫描需要 1 秒
struct SlowReconnectConnector {
    inner: Arc<MockConnector>,
}

#[async_trait::async_trait]
impl Connector for SlowReconnectConnector {
    async fn scan(&self, timeout: Duration) -> framelink_core::Result<Vec<ScannedDevice>> {
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.inner.scan(timeout).await
    }

    async fn connect(&self, device: &ScannedDevice) -> framelink_core::Result<Arc<dyn Transport>> {
        self.inner.connect(device).await
    }

    async fn reconnect(
        &self,
        _id: &str,
        timeout: Duration,
    ) -> framelink_core::Result<Option<Arc<dyn Transport>>> {
        tokio::time::sleep(timeout).await;
        Ok(None)
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_reconnect_leaves_time_for_rescan() {
    let mock = MockPeripheral::new();
    let connector = Arc::new(SlowReconnectConnector {
        inner: mock.connector(),
    });
    let conn = Connection::new(connector, settings());

    assert_eq!(
        conn.connect(Duration::from_secs(5)).await.unwrap(),
        ConnectOutcome::Fresh(Profile::Primary)
    );
    conn.disconnect().await.unwrap();

    assert_eq!(
        conn.connect(Duration::from_secs(5)).await.unwrap(),
        ConnectOutcome::Fresh(Profile::Primary)
    );
    assert_eq!(mock.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_fails_pending_wait() {
    let mock = MockPeripheral::new();
    let channel = connected_with(
        &mock,
        LinkSettings {
            auto_reconnect: false,
            ..settings()
        },
    )
    .await;

    let (result, ()) = tokio::join!(
        channel.run_script(
            "x=1",
            ScriptOptions::printed().with_timeout(Duration::from_secs(5))
        ),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            mock.drop_link();
        }
    );
    assert!(matches!(result, Err(FrameError::ConnectionLost)));
    assert_eq!(channel.connection().state(), LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_auto_reconnect_after_drop() {
    let mock = MockPeripheral::new();
    let channel = Arc::new(connected(&mock).await);
    let watcher = channel.spawn_auto_reconnect();

    mock.drop_link();
    assert!(!mock.has_function("prntLng"));
    // 重连后 bootstrap 完成的标志是外设上重新出现 helper
    for _ in 0..100 {
        if mock.connect_count() == 2 && mock.has_function("prntLng") && channel.helpers_loaded() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(mock.connect_count(), 2);
    assert!(channel.connection().is_connected().await);
    assert!(channel.helpers_loaded());
    watcher.abort();
}

#[tokio::test(start_paused = true)]
async fn test_user_disconnect_is_not_reconnected() {
    let mock = MockPeripheral::new();
    let channel = Arc::new(connected(&mock).await);
    let watcher = channel.spawn_auto_reconnect();

    channel.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(mock.connect_count(), 1);
    assert!(!mock.is_connected());
    watcher.abort();
}

#[tokio::test(start_paused = true)]
async fn test_file_roundtrip() {
    let mock = MockPeripheral::new();
    let channel = connected(&mock).await;
    let files = channel.files();

    let content: Vec<u8> = (0..=255u8).collect();
    files.write_file("/data/a.bin", &content).await.unwrap();
    assert_eq!(mock.file("/data/a.bin").unwrap(), content);
    assert!(files.file_exists("/data/a.bin").await.unwrap());
    assert_eq!(files.read_file("/data/a.bin").await.unwrap(), content);

    files.delete_file("/data/a.bin").await.unwrap();
    assert!(!files.file_exists("/data/a.bin").await.unwrap());
    assert!(matches!(
        files.read_file("/data/a.bin").await,
        Err(FrameError::PeripheralScript(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_binary_file_write() {
    let mock = MockPeripheral::new();
    let channel = connected(&mock).await;

    let content: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 256) as u8).collect();
    channel
        .files()
        .write_file_binary("/blob.bin", &content)
        .await
        .unwrap();
    assert_eq!(mock.file("/blob.bin").unwrap(), content);

    let frames: Vec<Vec<u8>> = mock
        .writes()
        .into_iter()
        .filter(|(_, data)| data.starts_with(&[0x01, 0x02]))
        .map(|(_, data)| data)
        .collect();
    assert!(frames.len() > 1);
    assert!(frames.iter().all(|frame| frame.len() <= 244));
}

#[tokio::test(start_paused = true)]
async fn test_battery_level() {
    let mock = MockPeripheral::new().with_battery("64.4");
    let channel = connected(&mock).await;
    assert_eq!(channel.battery_level().await.unwrap(), 64);

    let broken = MockPeripheral::new().with_battery("nil");
    let channel = connected(&broken).await;
    assert!(matches!(
        channel.battery_level().await,
        Err(FrameError::Protocol(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_sync_time_sends_clock_and_zone() {
    let mock = MockPeripheral::new();
    let channel = connected(&mock).await;
    mock.clear_events();

    channel.sync_time().await.unwrap();
    let sent = mock.tx_strings();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].starts_with("frame.time.utc("));
    assert!(sent[0].contains(";frame.time.zone(\""));
}

#[tokio::test(start_paused = true)]
async fn test_send_data_splits_long_payload() {
    let mock = MockPeripheral::new();
    let channel = connected(&mock).await;
    mock.clear_events();

    let payload = vec![0x5a; 600];
    channel.connection().send_data(&payload).await.unwrap();
    let frames: Vec<Vec<u8>> = mock
        .writes()
        .into_iter()
        .filter(|(endpoint, _)| *endpoint == Endpoint::Tx)
        .map(|(_, data)| data)
        .collect();
    assert!(frames.len() > 2);
    assert!(frames.iter().all(|f| f[0] == 0x01 && f.len() <= 244));
    let body: usize = frames[..frames.len() - 1].iter().map(|f| f.len() - 2).sum();
    assert_eq!(body, payload.len());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_data_sends_do_not_interleave() {
    let mock = MockPeripheral::new().with_write_delay(Duration::from_millis(5));
    let channel = connected(&mock).await;
    mock.clear_events();

    let conn = channel.connection();
    let (a, b) = tokio::join!(conn.send_data(&[0xaa; 600]), conn.send_data(&[0xbb; 600]));
    a.unwrap();
    b.unwrap();

    // 每帧的归属：数据块取首字节，结束标记记为 0
    let owners: Vec<u8> = mock
        .writes()
        .into_iter()
        .filter(|(endpoint, _)| *endpoint == Endpoint::Tx)
        .map(|(_, f)| if f[1] == 0x01 { f[2] } else { 0 })
        .collect();
    let first_end = owners.iter().position(|&o| o == 0).unwrap();
    let first = owners[0];
    assert!(first_end > 1);
    assert!(owners[..first_end].iter().all(|&o| o == first));
    let second = &owners[first_end + 1..];
    assert_eq!(second.last(), Some(&0));
    assert!(second[..second.len() - 1].iter().all(|&o| o != first && o != 0));
}

#[tokio::test(start_paused = true)]
async fn test_read_file_keeps_line_breaks() {
    let content = b"line one\nline two\n\nend\n";
    let mock = MockPeripheral::new().with_file("/notes.txt", content);
    let channel = connected(&mock).await;
    assert!(mock.has_function("readFile"));

    let data = channel.files().read_file("/notes.txt").await.unwrap();
    assert_eq!(data, content);
}

#[tokio::test(start_paused = true)]
async fn test_canned_reply_is_returned_verbatim() {
    let mock = MockPeripheral::new().with_reply("frame.imu.raw()", &["0.1,0.2,9.8"]);
    let channel = connected(&mock).await;
    let reply = channel
        .run_script("frame.imu.raw()", ScriptOptions::printed())
        .await
        .unwrap();
    assert_eq!(reply.as_deref(), Some("0.1,0.2,9.8"));
}

#[tokio::test(start_paused = true)]
async fn test_preloaded_helpers_are_not_rewritten() {
    let mock = MockPeripheral::new()
        .with_function("prntLng")
        .with_file("/notes.txt", b"kept on device");
    let channel = connected(&mock).await;
    assert!(channel.helpers_loaded());
    assert!(!mock.tx_strings().iter().any(|s| s.starts_with("w:write(")));
    assert!(channel.files().file_exists("/notes.txt").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_debug_print_stream() {
    let mock = MockPeripheral::new();
    let channel = connected(&mock).await;
    channel.set_print_debug(true);

    let mut prints = Box::pin(
        channel
            .connection()
            .router()
            .data_of_prefix(FramePrefix::DebugPrint),
    );
    mock.push_rx(&[0x01, 0x06, b'o', b'k']);
    assert_eq!(prints.next().await.unwrap().unwrap(), b"ok".to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_enter_dfu_mode() {
    let mock = MockPeripheral::new();
    let channel = connected(&mock).await;

    channel.enter_dfu_mode(Duration::from_secs(1)).await.unwrap();
    assert_eq!(channel.connection().state(), LinkState::DfuConnected);

    let result = channel.run_script("x=1", ScriptOptions::checked()).await;
    assert!(matches!(result, Err(FrameError::Protocol(_))));
}

async fn dfu_connection(mock: &MockPeripheral) -> Arc<Connection> {
    let conn = Arc::new(Connection::new(mock.connector(), settings()));
    assert_eq!(
        conn.connect(Duration::from_secs(1)).await.unwrap(),
        ConnectOutcome::Fresh(Profile::Dfu)
    );
    conn
}

#[tokio::test(start_paused = true)]
async fn test_dfu_crc_mismatch_aborts() {
    let mock = MockPeripheral::dfu().with_corrupt_crc();
    let conn = dfu_connection(&mock).await;

    let result = DfuClient::new(conn)
        .update_firmware(&[7u8; 40], &[9u8; 300])
        .await;
    assert!(matches!(result, Err(FrameError::Dfu(ref m)) if m.contains("CRC")));
    assert!(mock.executed_objects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dfu_transfer_tolerates_final_reboot() {
    let init: Vec<u8> = (0..40u8).collect();
    let image: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
    let mock = MockPeripheral::dfu()
        .with_dfu_object_size(64)
        .with_reboot_after_image(image.len());
    let conn = dfu_connection(&mock).await;

    let mut progress = Vec::new();
    DfuClient::new(conn.clone())
        .update_firmware_with_progress(&init, &image, |p| progress.push(p.sent))
        .await
        .unwrap();

    assert_eq!(mock.dfu_data(1), init);
    assert_eq!(mock.dfu_data(2), image);
    assert_eq!(mock.executed_objects(), vec![1, 2, 2, 2, 2]);
    assert_eq!(progress, vec![40, 64, 128, 192, 200]);

    let packets = mock
        .writes()
        .into_iter()
        .filter(|(endpoint, _)| *endpoint == Endpoint::DfuPacket)
        .count();
    assert!(packets >= 5);
}

#[tokio::test(start_paused = true)]
async fn test_dfu_requires_bootloader() {
    let mock = MockPeripheral::new();
    let channel = connected(&mock).await;
    let result = DfuClient::new(channel.connection().clone())
        .update_firmware(&[1], &[2])
        .await;
    assert!(matches!(result, Err(FrameError::Dfu(_))));
}
