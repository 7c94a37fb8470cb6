//! Connector, encoder and CRTC resolution
//!
//! A plain snapshot of the KMS resources the backend reads once at startup,
//! plus the allocation rules applied to it. Keeping this free of ioctls lets
//! the CRTC allocator be tested without hardware.

use std::collections::HashSet;

/// A display mode as far as selection cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeInfo {
    pub width: u16,
    pub height: u16,
    pub vrefresh: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub id: u32,
    pub connected: bool,
    pub modes: Vec<ModeInfo>,
    /// Encoder currently driving this connector, if any
    pub current_encoder: Option<u32>,
    /// Encoders this connector can be driven by
    pub encoders: Vec<u32>,
}

impl ConnectorInfo {
    /// Connected and reporting at least one mode
    pub fn is_usable(&self) -> bool {
        self.connected && !self.modes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInfo {
    pub id: u32,
    /// CRTC currently bound to this encoder
    pub crtc: Option<u32>,
    /// CRTCs this encoder can feed, in resource order
    pub possible_crtcs: Vec<u32>,
}

/// Snapshot of the device's mode-setting resources
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub connectors: Vec<ConnectorInfo>,
    pub encoders: Vec<EncoderInfo>,
    pub crtcs: Vec<u32>,
}

/// CRTC ids claimed by resolved connectors. One pool per device.
#[derive(Debug, Default)]
pub struct CrtcReservations {
    claimed: HashSet<u32>,
    owners: Vec<(u32, u32)>,
}

impl CrtcReservations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `crtc` is claimed by a connector other than `connector`
    pub fn is_taken(&self, crtc: u32, connector: u32) -> bool {
        self.owners
            .iter()
            .any(|&(c, owner)| c == crtc && owner != connector)
    }

    /// Claim `crtc` for `connector`. Fails if another connector holds it.
    pub fn reserve(&mut self, crtc: u32, connector: u32) -> bool {
        if self.is_taken(crtc, connector) {
            return false;
        }
        if self.claimed.insert(crtc) {
            self.owners.push((crtc, connector));
        }
        true
    }

    pub fn contains(&self, crtc: u32) -> bool {
        self.claimed.contains(&crtc)
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }
}

/// A resolved output path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModesetChoice {
    pub connector: u32,
    pub encoder: u32,
    pub crtc: u32,
}

impl Topology {
    pub fn encoder(&self, id: u32) -> Option<&EncoderInfo> {
        self.encoders.iter().find(|e| e.id == id)
    }

    /// Pick a CRTC for the connector at `index` and reserve it.
    ///
    /// The encoder already bound to the connector keeps its CRTC when no
    /// other connector has claimed it. Otherwise every encoder the connector
    /// supports is tried in order against every compatible CRTC, skipping
    /// claimed ones. Allocation is greedy, so the result depends on the order
    /// connectors are resolved in.
    pub fn find_crtc(
        &self,
        index: usize,
        reservations: &mut CrtcReservations,
    ) -> Option<ModesetChoice> {
        let conn = self.connectors.get(index)?;

        if let Some(enc) = conn.current_encoder.and_then(|id| self.encoder(id)) {
            if let Some(crtc) = enc.crtc {
                if reservations.reserve(crtc, conn.id) {
                    log::debug!("connector {}: reusing CRTC {}", conn.id, crtc);
                    return Some(ModesetChoice {
                        connector: conn.id,
                        encoder: enc.id,
                        crtc,
                    });
                }
            }
        }

        for enc in conn.encoders.iter().filter_map(|&id| self.encoder(id)) {
            for &crtc in &enc.possible_crtcs {
                if !self.crtcs.contains(&crtc) || reservations.contains(crtc) {
                    continue;
                }
                if reservations.reserve(crtc, conn.id) {
                    return Some(ModesetChoice {
                        connector: conn.id,
                        encoder: enc.id,
                        crtc,
                    });
                }
            }
        }

        log::error!("cannot find a suitable CRTC for connector {}", conn.id);
        None
    }
}

/// Choose a mode index for a connector.
///
/// With a requested size the matching mode with the highest refresh rate
/// wins (first one on ties). Without one, or when nothing matches, the
/// connector's first mode is used and its size becomes the output size.
pub fn select_mode(modes: &[ModeInfo], requested: Option<(u32, u32)>) -> Option<usize> {
    if modes.is_empty() {
        return None;
    }

    if let Some((w, h)) = requested {
        let mut best: Option<usize> = None;
        for (i, mode) in modes.iter().enumerate() {
            log::info!(
                "mode [{:2}/{:2}] {:4}x{:4}@{}",
                i,
                modes.len(),
                mode.width,
                mode.height,
                mode.vrefresh
            );
            if u32::from(mode.width) == w && u32::from(mode.height) == h {
                match best {
                    Some(b) if modes[b].vrefresh >= mode.vrefresh => {}
                    _ => best = Some(i),
                }
            }
        }
        if best.is_some() {
            return best;
        }
        log::warn!("no {}x{} mode on this connector, using the preferred mode", w, h);
    }

    Some(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mode(width: u16, height: u16, vrefresh: u32) -> ModeInfo {
        ModeInfo {
            width,
            height,
            vrefresh,
        }
    }

    fn connector(id: u32, current_encoder: Option<u32>, encoders: Vec<u32>) -> ConnectorInfo {
        ConnectorInfo {
            id,
            connected: true,
            modes: vec![mode(1920, 1080, 60)],
            current_encoder,
            encoders,
        }
    }

    fn two_head_topology() -> Topology {
        Topology {
            connectors: vec![
                connector(30, Some(20), vec![20]),
                connector(31, Some(21), vec![21]),
            ],
            encoders: vec![
                EncoderInfo {
                    id: 20,
                    crtc: Some(10),
                    possible_crtcs: vec![10, 11],
                },
                EncoderInfo {
                    id: 21,
                    crtc: Some(11),
                    possible_crtcs: vec![10, 11],
                },
            ],
            crtcs: vec![10, 11],
        }
    }

    #[test]
    fn reuses_bound_crtc() {
        let topo = two_head_topology();
        let mut res = CrtcReservations::new();
        let choice = topo.find_crtc(0, &mut res).unwrap();
        assert_eq!(
            choice,
            ModesetChoice {
                connector: 30,
                encoder: 20,
                crtc: 10
            }
        );
        assert!(res.contains(10));
    }

    #[test]
    fn selecting_second_connector_leaves_first_unreserved() {
        let topo = two_head_topology();
        let mut res = CrtcReservations::new();
        let choice = topo.find_crtc(1, &mut res).unwrap();
        assert_eq!(choice.connector, 31);
        assert_eq!(choice.crtc, 11);
        assert_eq!(res.len(), 1);
        assert!(!res.contains(10));
    }

    #[test]
    fn falls_back_to_global_search_when_bound_crtc_is_claimed() {
        let mut topo = two_head_topology();
        // Both encoders report the same bound CRTC
        topo.encoders[1].crtc = Some(10);
        let mut res = CrtcReservations::new();

        let a = topo.find_crtc(0, &mut res).unwrap();
        let b = topo.find_crtc(1, &mut res).unwrap();
        assert_eq!(a.crtc, 10);
        assert_eq!(b.crtc, 11);
    }

    #[test]
    fn unbound_connector_takes_first_compatible_free_crtc() {
        let mut topo = two_head_topology();
        topo.connectors[0].current_encoder = None;
        let mut res = CrtcReservations::new();
        res.reserve(10, 99);

        let choice = topo.find_crtc(0, &mut res).unwrap();
        assert_eq!(choice.encoder, 20);
        assert_eq!(choice.crtc, 11);
    }

    #[test]
    fn no_free_crtc_is_an_error() {
        let topo = two_head_topology();
        let mut res = CrtcReservations::new();
        res.reserve(10, 90);
        res.reserve(11, 91);
        assert!(topo.find_crtc(0, &mut res).is_none());
    }

    #[test]
    fn disconnected_connectors_keep_their_index() {
        let mut topo = two_head_topology();
        topo.connectors[0].connected = false;
        assert!(!topo.connectors[0].is_usable());
        let choice = topo.find_crtc(1, &mut CrtcReservations::new()).unwrap();
        assert_eq!(choice.connector, 31);
    }

    #[test]
    fn missing_connector_index() {
        let topo = two_head_topology();
        assert!(topo.find_crtc(5, &mut CrtcReservations::new()).is_none());
    }

    #[test]
    fn reservation_is_idempotent_for_the_owner() {
        let mut res = CrtcReservations::new();
        assert!(res.reserve(10, 1));
        assert!(res.reserve(10, 1));
        assert!(!res.reserve(10, 2));
        assert_eq!(res.len(), 1);
    }

    #[test]
    fn usable_requires_connection_and_modes() {
        let mut c = connector(1, None, vec![]);
        assert!(c.is_usable());
        c.modes.clear();
        assert!(!c.is_usable());
        c.modes.push(mode(640, 480, 60));
        c.connected = false;
        assert!(!c.is_usable());
    }

    #[test]
    fn requested_size_prefers_highest_refresh() {
        let modes = [
            mode(1920, 1080, 60),
            mode(800, 600, 60),
            mode(800, 600, 75),
            mode(800, 600, 72),
        ];
        assert_eq!(select_mode(&modes, Some((800, 600))), Some(2));
    }

    #[test]
    fn unmatched_or_absent_size_uses_first_mode() {
        let modes = [mode(1920, 1080, 60), mode(1280, 720, 60)];
        assert_eq!(select_mode(&modes, None), Some(0));
        assert_eq!(select_mode(&modes, Some((1024, 768))), Some(0));
        assert_eq!(select_mode(&[], None), None);
    }

    fn arb_topology() -> impl Strategy<Value = Topology> {
        (1usize..5, 1usize..5).prop_flat_map(|(n_crtcs, n_conn)| {
            let crtcs: Vec<u32> = (0..n_crtcs as u32).map(|i| 100 + i).collect();
            let enc = proptest::collection::vec(
                (
                    proptest::option::of(0..n_crtcs),
                    proptest::collection::vec(0..n_crtcs, 1..=n_crtcs),
                ),
                n_conn,
            );
            enc.prop_map(move |encs| {
                let encoders: Vec<EncoderInfo> = encs
                    .iter()
                    .enumerate()
                    .map(|(i, (bound, possible))| EncoderInfo {
                        id: 200 + i as u32,
                        crtc: bound.map(|b| crtcs[b]),
                        possible_crtcs: possible.iter().map(|&p| crtcs[p]).collect(),
                    })
                    .collect();
                let connectors = encoders
                    .iter()
                    .enumerate()
                    .map(|(i, e)| ConnectorInfo {
                        id: 300 + i as u32,
                        connected: true,
                        modes: vec![ModeInfo {
                            width: 640,
                            height: 480,
                            vrefresh: 60,
                        }],
                        current_encoder: Some(e.id),
                        encoders: vec![e.id],
                    })
                    .collect();
                Topology {
                    connectors,
                    encoders,
                    crtcs: crtcs.clone(),
                }
            })
        })
    }

    proptest! {
        #[test]
        fn no_two_connectors_share_a_crtc(topo in arb_topology()) {
            let mut res = CrtcReservations::new();
            let mut seen = HashSet::new();
            for i in 0..topo.connectors.len() {
                if let Some(choice) = topo.find_crtc(i, &mut res) {
                    prop_assert!(seen.insert(choice.crtc), "CRTC {} assigned twice", choice.crtc);
                    prop_assert!(topo.crtcs.contains(&choice.crtc));
                }
            }
            prop_assert_eq!(seen.len(), res.len());
        }
    }
}
