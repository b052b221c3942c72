//! The wireless medium.
//!
//! A single [`Medium`] entity receives every `TransmitAir` and fans the PPDU
//! out to the PHYs linked to the sender, applying per-link path loss,
//! log-normal shadowing and propagation delay.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use rand_distr::{Distribution, Normal};
use wifisim_common::{
    metric_defs, Entity, EntityId, Event, EventPayload, MetricLabels, Ppdu, ReceiveAirEvent, SimContext, SimError,
    SimTime, TransmitAirEvent,
};

/// Propagation parameters of one directed link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkParams {
    pub path_loss_db: f64,
    /// Standard deviation of the log-normal shadowing, 0 for none.
    #[serde(default)]
    pub shadowing_std_db: f64,
    #[serde(default)]
    pub delay: SimTime,
}

impl LinkParams {
    pub fn new(path_loss_db: f64) -> Self {
        Self {
            path_loss_db,
            shadowing_std_db: 0.0,
            delay: SimTime::ZERO,
        }
    }
}

/// Directed links between PHYs.
#[derive(Debug, Clone, Default)]
pub struct LinkModel {
    edges: BTreeMap<(EntityId, EntityId), LinkParams>,
}

impl LinkModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link(&mut self, from: EntityId, to: EntityId, params: LinkParams) {
        self.edges.insert((from, to), params);
    }

    /// Adds the link in both directions.
    pub fn add_bidirectional(&mut self, a: EntityId, b: EntityId, params: LinkParams) {
        self.add_link(a, b, params);
        self.add_link(b, a, params);
    }

    pub fn remove_link(&mut self, from: EntityId, to: EntityId) -> Option<LinkParams> {
        self.edges.remove(&(from, to))
    }

    pub fn get_link(&self, from: EntityId, to: EntityId) -> Option<&LinkParams> {
        self.edges.get(&(from, to))
    }

    pub fn get_receivers(&self, from: EntityId) -> impl Iterator<Item = (EntityId, &LinkParams)> {
        self.edges
            .iter()
            .filter(move |((f, t), _)| *f == from && *t != from)
            .map(|((_, to), params)| (*to, params))
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Subchannels a transmitted PPDU puts energy on. HE TB PPDUs only
/// occupy the subchannels of their RU.
fn occupied_bands(ppdu: &Ppdu) -> Vec<u16> {
    ppdu.tb_sta_id()
        .and_then(|sta_id| ppdu.ru_for(sta_id))
        .map(|ru| ru.band_centers_mhz(ppdu.channel_center_mhz(), ppdu.channel_width()))
        .unwrap_or_else(|| ppdu.band_centers_mhz())
}

/// Entity routing PPDUs from transmitters to receivers.
pub struct Medium {
    id: EntityId,
    link_model: LinkModel,
    metric_labels: MetricLabels,
}

impl Medium {
    pub fn new(id: EntityId, link_model: LinkModel) -> Self {
        Self {
            id,
            link_model,
            metric_labels: MetricLabels::new("medium", "medium"),
        }
    }

    pub fn link_model(&self) -> &LinkModel {
        &self.link_model
    }

    pub fn link_model_mut(&mut self) -> &mut LinkModel {
        &mut self.link_model
    }

    fn route(&self, tx: &TransmitAirEvent, ctx: &mut SimContext) {
        let bands = occupied_bands(&tx.ppdu);
        let split_db = 10.0 * (bands.len().max(1) as f64).log10();
        let labels = self.metric_labels.to_labels();

        for (receiver, link) in self.link_model.get_receivers(tx.phy_id) {
            let shadowing = if link.shadowing_std_db > 0.0 {
                Normal::new(0.0, link.shadowing_std_db)
                    .map(|normal| normal.sample(ctx.rng()))
                    .unwrap_or(0.0)
            } else {
                0.0
            };
            let per_band = tx.tx_power_dbm - link.path_loss_db + shadowing - split_db;
            let rx_power_dbm = bands.iter().map(|b| (*b, per_band)).collect();
            tracing::trace!(
                from = %tx.phy_id,
                to = %receiver,
                uid = tx.ppdu.uid(),
                per_band_dbm = per_band,
                "delivering PPDU"
            );
            ctx.post_event(
                link.delay,
                vec![receiver],
                EventPayload::ReceiveAir(ReceiveAirEvent {
                    source_phy_id: tx.phy_id,
                    ppdu: Arc::clone(&tx.ppdu),
                    rx_power_dbm,
                    end_time: tx.end_time + link.delay,
                }),
            );
            metrics::counter!(metric_defs::MEDIUM_DELIVERIES.name, &labels).increment(1);
        }
    }
}

impl Entity for Medium {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn handle_event(&mut self, event: &Event, ctx: &mut SimContext) -> Result<(), SimError> {
        if let EventPayload::TransmitAir(tx) = &event.payload {
            self.route(tx, ctx);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wifi_ppdu::{Band, HeMuUserInfo, MacAddr, Mpdu, PreambleType, Psdu, RuSpec, RuType, TxVector, WifiMode};

    fn psdu() -> Psdu {
        Psdu::single(Mpdu::new(MacAddr::BROADCAST, MacAddr::new([2, 0, 0, 0, 0, 1]), 0, vec![0; 200]))
    }

    #[test]
    fn test_receivers_exclude_self() {
        let mut links = LinkModel::new();
        links.add_bidirectional(EntityId(1), EntityId(2), LinkParams::new(60.0));
        links.add_link(EntityId(1), EntityId(1), LinkParams::new(0.0));
        let receivers: Vec<_> = links.get_receivers(EntityId(1)).map(|(id, _)| id).collect();
        assert_eq!(receivers, vec![EntityId(2)]);
        assert_eq!(links.len(), 3);
    }

    #[test]
    fn test_power_split_over_bands() {
        let mut links = LinkModel::new();
        links.add_link(EntityId(1), EntityId(2), LinkParams::new(60.0));
        let mut medium = Medium::new(EntityId(0), links);

        let txv = TxVector::new(WifiMode::vht(0).unwrap(), PreambleType::VhtSu, 40);
        let ppdu = Ppdu::new(BTreeMap::from([(wifi_ppdu::SU_STA_ID, psdu())]), &txv, Band::Ghz5, 5190, 7).unwrap();
        let mut ctx = SimContext::new(1);
        let event = Event {
            id: wifisim_common::EventId(0),
            time: SimTime::ZERO,
            source: EntityId(1),
            targets: vec![EntityId(0)],
            payload: EventPayload::TransmitAir(TransmitAirEvent {
                phy_id: EntityId(1),
                ppdu: Arc::new(ppdu),
                tx_power_dbm: 20.0,
                end_time: SimTime::from_micros(100),
            }),
        };
        medium.handle_event(&event, &mut ctx).unwrap();
        let posted = ctx.take_pending_events();
        assert_eq!(posted.len(), 1);
        let EventPayload::ReceiveAir(rx) = &posted[0].payload else {
            panic!("expected ReceiveAir");
        };
        assert_eq!(rx.rx_power_dbm.len(), 2);
        assert!((rx.total_rx_power_dbm() - (-40.0)).abs() < 1e-9);
    }

    #[test]
    fn test_tb_ppdu_occupies_its_ru() {
        let txv = TxVector::new(WifiMode::he(0).unwrap(), PreambleType::HeTb, 40)
            .with_user(5, HeMuUserInfo::new(RuSpec::new(RuType::Ru242, 2), 0, 1));
        let ppdu = Ppdu::new(BTreeMap::from([(5, psdu())]), &txv, Band::Ghz5, 5190, 3).unwrap();
        assert_eq!(occupied_bands(&ppdu), vec![5200]);
    }
}
