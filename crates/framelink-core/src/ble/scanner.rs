//! BLE Scanner - 发现眼镜设备
//!
//! 过滤条件：
//! - 广播主服务 UUID 或 DFU 服务 UUID
//! - 广播名称命中允许列表（前缀匹配）
//!
//! 多个候选时选择信号最强的一个。

use log::{debug, info, trace};

use crate::ble::{DFU_SERVICE_UUID, PRIMARY_SERVICE_UUID, Profile};
use crate::error::{FrameError, Result};
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time;

/// 首个候选出现后继续收集的时间，用于比较信号强度
const SETTLE_AFTER_FIRST: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub id: String,
    pub name: String,
    pub rssi: Option<i16>,
    pub profile: Profile,
}

/// 名称是否命中允许列表；空列表表示不过滤
pub fn name_allowed(name: &str, allow_list: &[String]) -> bool {
    allow_list.is_empty() || allow_list.iter().any(|prefix| name.starts_with(prefix.as_str()))
}

/// 从候选中选出信号最强的设备（缺少 RSSI 的视为最弱）
pub fn pick_strongest(devices: &[ScannedDevice]) -> Option<&ScannedDevice> {
    devices
        .iter()
        .max_by_key(|d| d.rssi.unwrap_or(i16::MIN))
}

pub struct BleScanner {
    adapter: Adapter,
    allow_list: Vec<String>,
}

impl BleScanner {
    pub async fn new(allow_list: Vec<String>) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters.into_iter().next().ok_or(FrameError::NoAdapter)?;
        Ok(Self {
            adapter,
            allow_list,
        })
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// 扫描匹配设备，返回 (设备信息, 平台句柄)
    pub async fn scan(&self, timeout: Duration) -> Result<Vec<(ScannedDevice, Peripheral)>> {
        let filter = ScanFilter {
            services: vec![PRIMARY_SERVICE_UUID, DFU_SERVICE_UUID],
        };
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(filter).await?;

        info!("Starting BLE scan for up to {:?}", timeout);

        let mut found: HashMap<String, (ScannedDevice, Peripheral)> = HashMap::new();
        let deadline = time::Instant::now() + timeout;
        let mut settle_deadline: Option<time::Instant> = None;

        loop {
            let until = settle_deadline.map_or(deadline, |s| s.min(deadline));
            tokio::select! {
                () = time::sleep_until(until) => break,
                event = events.next() => {
                    let id = match event {
                        Some(CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) => id,
                        Some(_) => continue,
                        None => break,
                    };
                    let peripheral = self.adapter.peripheral(&id).await?;
                    if let Some(dev) = self.parse_device(&peripheral).await? {
                        if !found.contains_key(&dev.id) {
                            debug!("Candidate found: id={}, name='{}', rssi={:?}", dev.id, dev.name, dev.rssi);
                        }
                        settle_deadline.get_or_insert_with(|| time::Instant::now() + SETTLE_AFTER_FIRST);
                        found.insert(dev.id.clone(), (dev, peripheral));
                    }
                }
            }
        }

        // 扫描开始前已缓存的设备不会再产生 Discovered 事件
        for peripheral in self.adapter.peripherals().await? {
            if let Some(dev) = self.parse_device(&peripheral).await? {
                found.entry(dev.id.clone()).or_insert((dev, peripheral));
            }
        }

        let _ = self.adapter.stop_scan().await;
        info!("Scan complete: found {} device(s)", found.len());
        Ok(found.into_values().collect())
    }

    async fn parse_device(&self, peripheral: &Peripheral) -> Result<Option<ScannedDevice>> {
        let Some(props) = peripheral.properties().await? else {
            return Ok(None);
        };
        let Some(profile) = Profile::from_services(&props.services) else {
            return Ok(None);
        };
        let name = props.local_name.unwrap_or_default();
        if !name_allowed(&name, &self.allow_list) {
            trace!("Ignoring '{}': not in allow list", name);
            return Ok(None);
        }
        Ok(Some(ScannedDevice {
            id: format!("{:?}", peripheral.id()),
            name,
            rssi: props.rssi,
            profile,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, rssi: Option<i16>) -> ScannedDevice {
        ScannedDevice {
            id: name.to_string(),
            name: name.to_string(),
            rssi,
            profile: Profile::Primary,
        }
    }

    #[test]
    fn test_pick_strongest() {
        let devices = vec![
            device("Frame a1", Some(-80)),
            device("Frame b2", Some(-42)),
            device("Frame c3", None),
        ];
        assert_eq!(pick_strongest(&devices).unwrap().name, "Frame b2");
        assert!(pick_strongest(&[]).is_none());
    }

    #[test]
    fn test_name_allow_list() {
        let allow = vec!["Frame".to_string(), "Frame Update".to_string()];
        assert!(name_allowed("Frame 4F", &allow));
        assert!(name_allowed("Frame Update", &allow));
        assert!(!name_allowed("Muse-AB12", &allow));
        assert!(name_allowed("anything", &[]));
    }
}
