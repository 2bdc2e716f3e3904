use std::net::IpAddr;
use std::sync::Mutex;

/// Node facts shared between the manager and the VXLAN device sync loop.
///
/// The manager writes the node IP and the unblocking flag. The device sync
/// loop reads the node IP and writes the VXLAN link index once the device
/// exists.
#[derive(Debug, Default)]
pub struct NodeState {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    node_ip: Option<IpAddr>,
    vxlan_link_index: Option<u32>,
    unblocking_update: bool,
}

impl NodeState {
    pub fn node_ip(&self) -> Option<IpAddr> {
        self.inner.lock().unwrap().node_ip
    }

    pub fn set_node_ip(&self, ip: IpAddr) {
        self.inner.lock().unwrap().node_ip = Some(ip);
    }

    pub fn vxlan_link_index(&self) -> Option<u32> {
        self.inner.lock().unwrap().vxlan_link_index
    }

    /// Called by the device sync loop once the VXLAN device is up. A change
    /// unblocks a manager that is waiting after a failed pass.
    pub fn set_vxlan_link_index(&self, index: u32) {
        let mut inner = self.inner.lock().unwrap();
        if inner.vxlan_link_index != Some(index) {
            inner.vxlan_link_index = Some(index);
            inner.unblocking_update = true;
        }
    }

    pub fn clear_vxlan_link_index(&self) {
        self.inner.lock().unwrap().vxlan_link_index = None;
    }

    pub(crate) fn mark_unblocking_update(&self) {
        self.inner.lock().unwrap().unblocking_update = true;
    }

    /// Returns whether anything worth retrying for arrived since the last
    /// call.
    pub(crate) fn take_unblocking_update(&self) -> bool {
        std::mem::take(&mut self.inner.lock().unwrap().unblocking_update)
    }
}
