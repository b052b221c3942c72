//! Reception pipeline.
//!
//! preamble arrival → detection window → header fields one by one →
//! payload (SU, DL MU, or one payload per HE TB sender) → MPDU ends →
//! end of reception. Every step runs from a timer tied to the reception's
//! arena slot; aborting a reception cancels all of them.

use super::event::{PhyTimer, RxContribution, RxEvent, RxHandle, RxStage, StaPayload};
use super::WifiPhy;
use crate::detection::PREAMBLE_DETECTION_WINDOW;
use crate::{dbm_to_mw, mw_to_dbm, ratio_to_db};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use wifi_ppdu::{phy_entity, FieldRxInput, PpduField, RxFailureAction, TxVector, SU_STA_ID};
use wifisim_common::{
    metric_defs, DropReason, EventPayload, PhyRxPsduEvent, PhyState, Ppdu, PreambleType, Psdu, ReceiveAirEvent,
    SimContext, SimTime, StaId,
};

/// What to do with an arriving HE TB PPDU.
enum TbArrival {
    New,
    Merge(RxHandle),
    Reject(DropReason),
}

impl WifiPhy {
    // ------------------------------------------------------------------------
    // Arrival and preamble detection
    // ------------------------------------------------------------------------

    pub(super) fn start_receive_preamble(&mut self, rx: &ReceiveAirEvent, ctx: &mut SimContext) {
        let now = ctx.time();
        let in_channel: BTreeMap<u16, f64> = rx
            .rx_power_dbm
            .iter()
            .filter(|(band, _)| self.channel.contains_band(**band))
            .map(|(band, dbm)| (*band, *dbm))
            .collect();
        if in_channel.is_empty() {
            tracing::trace!(phy = %self.id, uid = rx.ppdu.uid(), "PPDU outside the operating channel");
            return;
        }

        let signal = self.interference.add(&in_channel, now, rx.end_time);
        ctx.post_event(
            rx.end_time - now,
            vec![self.id],
            EventPayload::Timer {
                timer_id: PhyTimer::SignalEnd(signal).encode(),
            },
        );
        let ppdu = Arc::clone(&rx.ppdu);
        let rx_power_dbm = mw_to_dbm(in_channel.values().map(|dbm| dbm_to_mw(*dbm)).sum());

        let busy = match self.state.state() {
            PhyState::Tx => Some(DropReason::Txing),
            PhyState::Sleep => Some(DropReason::Sleeping),
            PhyState::Off => Some(DropReason::PoweredOff),
            PhyState::Switching => Some(DropReason::ChannelSwitching),
            PhyState::Idle | PhyState::CcaBusy | PhyState::Rx => None,
        };
        if let Some(reason) = busy {
            self.notify_drop(&ppdu, reason, rx_power_dbm, ctx);
            return;
        }

        if !in_channel.contains_key(&self.channel.primary20_center_mhz()) {
            tracing::debug!(
                phy = %self.id,
                uid = ppdu.uid(),
                "PPDU does not cover the primary 20 MHz channel, counted as interference"
            );
            self.refresh_cca(ctx);
            return;
        }

        let contribution = RxContribution {
            source: rx.source_phy_id,
            ppdu: Arc::clone(&ppdu),
            signal,
            rx_power_dbm,
        };

        if ppdu.preamble() == PreambleType::HeTb {
            match self.check_tb_arrival(&ppdu, now) {
                TbArrival::Reject(reason) => {
                    self.notify_drop(&ppdu, reason, rx_power_dbm, ctx);
                    self.refresh_cca(ctx);
                    return;
                }
                TbArrival::Merge(handle) => {
                    if let Some(ev) = self.arena.get_mut(handle) {
                        ev.contributions.push(contribution);
                        tracing::debug!(
                            phy = %self.id,
                            uid = ppdu.uid(),
                            senders = ev.contributions.len(),
                            "HE TB PPDU merged into ongoing reception"
                        );
                    }
                    return;
                }
                TbArrival::New => {}
            }
        }

        if let Some(handle) = self.current {
            let current = self.arena.get(handle).map(|ev| (ev.stage, ev.start, ev.rx_power_dbm()));
            match current {
                None => self.current = None,
                Some((stage, start, current_dbm)) => {
                    let reason = match stage {
                        RxStage::PreambleDetection if rx_power_dbm > current_dbm => {
                            DropReason::PreambleDetectionPacketSwitch
                        }
                        RxStage::PreambleDetection => {
                            self.notify_drop(&ppdu, DropReason::BusyDecodingPreamble, rx_power_dbm, ctx);
                            return;
                        }
                        RxStage::Header | RxStage::Payload => {
                            let capture = self.config.frame_capture.is_some_and(|fc| {
                                fc.is_in_capture_window(start + PREAMBLE_DETECTION_WINDOW, now)
                                    && fc.capture_new_frame(current_dbm, rx_power_dbm)
                            });
                            if !capture {
                                self.notify_drop(&ppdu, DropReason::Rxing, rx_power_dbm, ctx);
                                return;
                            }
                            DropReason::FrameCapturePacketSwitch
                        }
                    };
                    tracing::debug!(phy = %self.id, uid = ppdu.uid(), %reason, "switching to stronger PPDU");
                    self.abort_reception(handle, reason, ctx);
                }
            }
        }

        let handle = self.arena.insert(RxEvent::new(contribution, now, rx.end_time));
        self.current = Some(handle);
        if ppdu.preamble() == PreambleType::HeTb {
            if let Some(tb) = self.tb_expectation.as_mut() {
                tb.first_arrival = Some(now);
            }
        }
        let labels = self.metric_labels.to_labels();
        metrics::histogram!(metric_defs::PHY_RX_POWER.name, &labels).record(rx_power_dbm);
        tracing::trace!(phy = %self.id, uid = ppdu.uid(), preamble = %ppdu.preamble(), rx_power_dbm, "preamble arriving");

        self.schedule_rx(
            handle,
            now + PREAMBLE_DETECTION_WINDOW,
            PhyTimer::PreambleDetectionEnd(handle),
            ctx,
        );
        if self.state.state() == PhyState::Rx {
            let next = self.cca_state(now);
            self.set_state(next, ctx);
        } else {
            self.refresh_cca(ctx);
        }
    }

    fn check_tb_arrival(&self, ppdu: &Ppdu, now: SimTime) -> TbArrival {
        // Non-AP receivers reject HE TB PPDUs once SIG-A is decoded.
        if !self.config.is_ap {
            return TbArrival::New;
        }
        let Some(tb) = self.tb_expectation.filter(|tb| tb.uid == ppdu.uid()) else {
            return TbArrival::Reject(DropReason::Filtered);
        };
        match tb.first_arrival {
            None => TbArrival::New,
            Some(first) if first != now => TbArrival::Reject(DropReason::HeTbPpduTooLate),
            Some(_) => match self.current.and_then(|h| self.arena.get(h).map(|ev| (h, ev.key()))) {
                Some((handle, key)) if key == (ppdu.uid(), PreambleType::HeTb) => TbArrival::Merge(handle),
                _ => TbArrival::New,
            },
        }
    }

    pub(super) fn end_preamble_detection_period(&mut self, handle: RxHandle, ctx: &mut SimContext) {
        let now = ctx.time();
        let Some(ev) = self.arena.get(handle) else {
            return;
        };
        let own = ev.signals();
        let primary = [self.channel.primary20_center_mhz()];
        let rssi_dbm = self.interference.power_dbm(&own, &primary);
        let snr_db = self
            .interference
            .sinr_chunks(&own, &[], &primary, ev.start, now)
            .iter()
            .map(|(_, sinr)| *sinr)
            .fold(f64::INFINITY, f64::min);
        let snr_db = ratio_to_db(snr_db);

        if !self.config.preamble_detection.is_detected(rssi_dbm, snr_db) {
            tracing::debug!(phy = %self.id, uid = ev.uid, rssi_dbm, snr_db, "preamble not detected");
            self.abort_reception(handle, DropReason::PreambleDetectFailure, ctx);
            self.end_of_activity(ctx);
            return;
        }

        tracing::debug!(phy = %self.id, uid = ev.uid, rssi_dbm, snr_db, "preamble detected");
        if let Some(ev) = self.arena.get_mut(handle) {
            ev.stage = RxStage::Header;
        }
        self.set_state(PhyState::Rx, ctx);
        self.start_receive_header(handle, ctx);
    }

    // ------------------------------------------------------------------------
    // Header
    // ------------------------------------------------------------------------

    fn start_receive_header(&mut self, handle: RxHandle, ctx: &mut SimContext) {
        let Some(ev) = self.arena.get_mut(handle) else {
            return;
        };
        let decoded = ev.ppdu().tx_vector();
        let uid = ev.uid;
        match decoded {
            Ok(txv) => ev.tx_vector = Some(txv),
            Err(e) => {
                tracing::debug!(phy = %self.id, uid, error = %e, "cannot interpret PPDU header");
                self.abort_reception(handle, DropReason::UnsupportedSettings, ctx);
                self.end_of_activity(ctx);
                return;
            }
        }
        self.schedule_next_field(handle, PpduField::Preamble, ctx);
    }

    /// Schedules the end of the next decoded header field after `after`,
    /// or the start of the data field.
    fn schedule_next_field(&mut self, handle: RxHandle, after: PpduField, ctx: &mut SimContext) {
        let Some(ev) = self.arena.get(handle) else {
            return;
        };
        let Some(txv) = ev.tx_vector.as_ref() else {
            return;
        };
        let entity = phy_entity(txv.modulation_class());
        let mut offset = ev.start;
        let mut passed = false;
        let mut next = None;
        for field in entity.ppdu_fields(ev.preamble) {
            let duration = match field {
                PpduField::Data => SimTime::ZERO,
                _ => SimTime::from(entity.field_duration(*field, txv)),
            };
            if passed {
                if *field == PpduField::Data {
                    next = Some((offset, PhyTimer::PayloadStart(handle)));
                    break;
                }
                if entity.sig_mode(*field, txv).is_some() {
                    next = Some((offset + duration, PhyTimer::FieldEnd(handle, *field)));
                    break;
                }
            }
            if *field == after {
                passed = true;
            }
            offset += duration;
        }

        match next {
            Some((at, timer)) => self.schedule_rx(handle, at, timer, ctx),
            None => {
                tracing::warn!(phy = %self.id, preamble = %ev.preamble, %after, "no field follows");
                self.abort_reception(handle, DropReason::UnsupportedSettings, ctx);
                self.end_of_activity(ctx);
            }
        }
    }

    pub(super) fn end_receive_field(&mut self, handle: RxHandle, field: PpduField, ctx: &mut SimContext) {
        match field {
            PpduField::NonHtHeader => self.continue_receive_header(handle, ctx),
            PpduField::HtSig | PpduField::SigA => self.end_receive_common_header(handle, field, ctx),
            PpduField::SigB => self.end_receive_sig_b(handle, ctx),
            other => {
                if self.receive_header_field(handle, other, ctx) {
                    self.schedule_next_field(handle, other, ctx);
                }
            }
        }
    }

    /// End of the L-SIG: the receiver now knows the PPDU duration.
    fn continue_receive_header(&mut self, handle: RxHandle, ctx: &mut SimContext) {
        if !self.receive_header_field(handle, PpduField::NonHtHeader, ctx) {
            return;
        }
        if let Some(ev) = self.arena.get(handle) {
            tracing::trace!(phy = %self.id, uid = ev.uid, end = %ev.end, "L-SIG received");
        }
        self.schedule_next_field(handle, PpduField::NonHtHeader, ctx);
    }

    /// End of HT-SIG or SIG-A: amendment, width, colour and stream checks.
    fn end_receive_common_header(&mut self, handle: RxHandle, field: PpduField, ctx: &mut SimContext) {
        if !self.receive_header_field(handle, field, ctx) {
            return;
        }
        self.schedule_next_field(handle, field, ctx);
    }

    /// End of SIG-B: the station looks itself up in the user list.
    fn end_receive_sig_b(&mut self, handle: RxHandle, ctx: &mut SimContext) {
        if !self.receive_header_field(handle, PpduField::SigB, ctx) {
            return;
        }
        if let Some(ev) = self.arena.get(handle) {
            tracing::trace!(phy = %self.id, uid = ev.uid, sta_id = self.caps.sta_id, "SIG-B received");
        }
        self.schedule_next_field(handle, PpduField::SigB, ctx);
    }

    /// Runs the PER draw and content checks for a header field. Returns
    /// false if the reception was stopped.
    fn receive_header_field(&mut self, handle: RxHandle, field: PpduField, ctx: &mut SimContext) -> bool {
        let now = ctx.time();
        let Some(ev) = self.arena.get(handle) else {
            return false;
        };
        let Some(txv) = ev.tx_vector.clone() else {
            return false;
        };
        let entity = phy_entity(txv.modulation_class());
        let Some(mode) = entity.sig_mode(field, &txv) else {
            return true;
        };
        let own = ev.signals();
        let rx_power_dbm = ev.rx_power_dbm();
        let from = now - SimTime::from(entity.field_duration(field, &txv));
        let primary = [self.channel.primary20_center_mhz()];
        let eval = self.interference.evaluate(
            self.error_model.as_ref(),
            mode,
            mode.data_rate(20, 800, 1),
            &own,
            &[],
            &primary,
            from,
            now,
        );
        let input = FieldRxInput {
            tx_vector: &txv,
            success_rate: eval.success_rate,
            rx_power_dbm,
            caps: &self.caps,
        };
        let status = entity.end_receive_field(field, &input, ctx.rng());
        if status.success || status.action == RxFailureAction::Ignore {
            return true;
        }

        let reason = status.reason.unwrap_or_else(|| entity.field_failure_reason(field));
        tracing::debug!(
            phy = %self.id,
            uid = ev.uid,
            %field,
            %reason,
            action = ?status.action,
            sinr_db = eval.min_sinr_db,
            "header field failed"
        );
        if status.action == RxFailureAction::Abort {
            for signal in &own {
                self.interference.set_ignored_for_cca(*signal);
            }
        }
        self.abort_reception(handle, reason, ctx);
        self.end_of_activity(ctx);
        false
    }

    // ------------------------------------------------------------------------
    // Payload
    // ------------------------------------------------------------------------

    pub(super) fn start_receive_data(&mut self, handle: RxHandle, ctx: &mut SimContext) {
        let Some(ev) = self.arena.get(handle) else {
            return;
        };
        if ev.preamble == PreambleType::HeTb {
            self.start_receive_ofdma_payload(handle, ctx);
        } else {
            self.start_receive_payload(handle, ctx);
        }
    }

    /// SU and DL MU payload: one PSDU for this station.
    fn start_receive_payload(&mut self, handle: RxHandle, ctx: &mut SimContext) {
        let now = ctx.time();
        let Some(ev) = self.arena.get(handle) else {
            return;
        };
        let Some(txv) = ev.tx_vector.clone() else {
            return;
        };
        let ppdu = Arc::clone(ev.ppdu());
        let end = ev.end;
        let sta_id = if ppdu.is_mu() { self.caps.sta_id } else { SU_STA_ID };
        let Some(psdu) = ppdu.psdu_for(self.caps.bss_color, sta_id).cloned() else {
            self.abort_reception(handle, DropReason::Filtered, ctx);
            self.end_of_activity(ctx);
            return;
        };
        let payload = self.build_payload(0, sta_id, psdu, txv, &ppdu, now, end);
        self.install_payloads(handle, vec![payload], ctx);
    }

    /// HE TB payload: one PSDU per sender, each on its own RU.
    fn start_receive_ofdma_payload(&mut self, handle: RxHandle, ctx: &mut SimContext) {
        let now = ctx.time();
        let Some(ev) = self.arena.get(handle) else {
            return;
        };
        let mut payloads = Vec::new();
        for (index, contribution) in ev.contributions.iter().enumerate() {
            let Some(sta_id) = contribution.ppdu.tb_sta_id() else {
                continue;
            };
            let txv = match contribution.ppdu.tx_vector() {
                Ok(txv) => txv,
                Err(e) => {
                    tracing::debug!(phy = %self.id, sta_id, error = %e, "cannot interpret HE TB header");
                    continue;
                }
            };
            let Some(psdu) = contribution.ppdu.psdu_for(self.caps.bss_color, sta_id).cloned() else {
                continue;
            };
            payloads.push(self.build_payload(index, sta_id, psdu, txv, &contribution.ppdu, now, ev.end));
        }
        if payloads.is_empty() {
            self.abort_reception(handle, DropReason::Filtered, ctx);
            self.end_of_activity(ctx);
            return;
        }
        tracing::debug!(phy = %self.id, uid = ev.uid, senders = payloads.len(), "receiving OFDMA payload");
        self.install_payloads(handle, payloads, ctx);
    }

    #[allow(clippy::too_many_arguments)]
    fn build_payload(
        &self,
        contribution: usize,
        sta_id: StaId,
        psdu: Psdu,
        tx_vector: TxVector,
        ppdu: &Ppdu,
        data_start: SimTime,
        end: SimTime,
    ) -> StaPayload {
        let mode = tx_vector.mode_for(sta_id);
        let gi = tx_vector.guard_interval_ns();
        let nss = tx_vector.nss_for(sta_id);
        let ru = if ppdu.is_mu() { ppdu.ru_for(sta_id) } else { None };
        let (rate_bps, bands) = match ru {
            Some(ru) => (
                mode.ru_data_rate(ru.ru_type, gi, nss),
                ru.band_centers_mhz(ppdu.channel_center_mhz(), ppdu.channel_width()),
            ),
            None => (mode.data_rate(tx_vector.channel_width(), gi, nss), ppdu.band_centers_mhz()),
        };
        let bands = bands.into_iter().filter(|b| self.channel.contains_band(*b)).collect();
        let entity = phy_entity(tx_vector.modulation_class());
        let mpdu_ends = entity
            .mpdu_end_offsets(&psdu.subframe_sizes(), &tx_vector, ppdu.band(), sta_id)
            .into_iter()
            .map(|offset| (data_start + offset).min(end))
            .collect();
        StaPayload {
            contribution,
            sta_id,
            psdu,
            tx_vector,
            mode,
            rate_bps,
            bands,
            data_start,
            mpdu_ends,
            mpdu_success: Vec::new(),
            min_sinr_db: f64::INFINITY,
        }
    }

    fn install_payloads(&mut self, handle: RxHandle, payloads: Vec<StaPayload>, ctx: &mut SimContext) {
        let mut timers = Vec::new();
        for (payload, p) in payloads.iter().enumerate() {
            for (index, at) in p.mpdu_ends.iter().enumerate() {
                timers.push((
                    *at,
                    PhyTimer::MpduEnd {
                        rx: handle,
                        payload: payload as u16,
                        index: index as u16,
                    },
                ));
            }
        }
        let Some(ev) = self.arena.get_mut(handle) else {
            return;
        };
        ev.stage = RxStage::Payload;
        ev.payloads = payloads;
        let end = ev.end;
        timers.sort_by_key(|(at, _)| *at);
        for (at, timer) in timers {
            self.schedule_rx(handle, at, timer, ctx);
        }
        self.schedule_rx(handle, end, PhyTimer::ReceiveEnd(handle), ctx);
    }

    /// Judges one A-MPDU subframe against the SINR over its airtime.
    pub(super) fn end_of_mpdu(&mut self, handle: RxHandle, payload: usize, index: usize, ctx: &mut SimContext) {
        let now = ctx.time();
        let Some(ev) = self.arena.get(handle) else {
            return;
        };
        let Some(p) = ev.payloads.get(payload) else {
            return;
        };
        let from = match index.checked_sub(1) {
            Some(prev) => p.mpdu_ends.get(prev).copied().unwrap_or(p.data_start),
            None => p.data_start,
        };
        let own = [ev.contributions[p.contribution].signal];
        let exclude = ev.signals();
        let eval = self.interference.evaluate(
            self.error_model.as_ref(),
            p.mode,
            p.rate_bps,
            &own,
            &exclude,
            &p.bands,
            from,
            now,
        );
        let ok = ctx.rng().gen::<f64>() <= eval.success_rate;
        tracing::trace!(
            phy = %self.id,
            uid = ev.uid,
            sta_id = p.sta_id,
            index,
            ok,
            sinr_db = eval.min_sinr_db,
            "end of MPDU"
        );
        if let Some(p) = self.arena.get_mut(handle).and_then(|ev| ev.payloads.get_mut(payload)) {
            p.mpdu_success.push(ok);
            p.min_sinr_db = p.min_sinr_db.min(eval.min_sinr_db);
        }
    }

    pub(super) fn end_receive(&mut self, handle: RxHandle, ctx: &mut SimContext) {
        let now = ctx.time();
        if self.current == Some(handle) {
            self.current = None;
        }
        let Some(ev) = self.arena.remove(handle) else {
            return;
        };
        let labels = self.labels_with("preamble", ev.preamble.as_label());
        for payload in ev.payloads {
            let contribution = &ev.contributions[payload.contribution];
            let ok = payload.mpdu_success.iter().filter(|s| **s).count() as u64;
            let failed = payload.mpdu_success.len() as u64 - ok;
            self.stats.mpdus_ok += ok;
            self.stats.mpdus_failed += failed;

            let rx = PhyRxPsduEvent {
                ppdu_uid: ev.uid,
                source_phy_id: contribution.source,
                sta_id: payload.sta_id,
                psdu: payload.psdu,
                tx_vector: payload.tx_vector,
                mpdu_success: payload.mpdu_success,
                snr_db: payload.min_sinr_db,
                rx_power_dbm: contribution.rx_power_dbm,
                start_time: ev.start,
                end_time: now,
            };
            let event = if ok > 0 {
                self.stats.rx_ok += 1;
                metrics::counter!(metric_defs::PHY_RX_OK.name, &labels).increment(1);
                if rx.snr_db.is_finite() {
                    metrics::histogram!(metric_defs::PHY_RX_SNR.name, &labels).record(rx.snr_db);
                }
                tracing::debug!(phy = %self.id, uid = ev.uid, sta_id = rx.sta_id, ok, failed, snr_db = rx.snr_db, "PSDU received");
                EventPayload::PhyRxOk(rx)
            } else {
                self.stats.rx_error += 1;
                metrics::counter!(metric_defs::PHY_RX_ERROR.name, &labels).increment(1);
                tracing::debug!(phy = %self.id, uid = ev.uid, sta_id = rx.sta_id, failed, snr_db = rx.snr_db, "PSDU in error");
                EventPayload::PhyRxError(rx)
            };
            if !self.listeners.is_empty() {
                ctx.post_immediate(self.listeners.clone(), event);
            }
        }
        if ev.preamble == PreambleType::HeTb {
            self.tb_expectation = None;
        }
        self.end_of_activity(ctx);
    }

    // ------------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------------

    fn schedule_rx(&mut self, handle: RxHandle, at: SimTime, timer: PhyTimer, ctx: &mut SimContext) {
        let delay = at - ctx.time();
        let id = ctx.post_event(
            delay,
            vec![self.id],
            EventPayload::Timer {
                timer_id: timer.encode(),
            },
        );
        if let Some(ev) = self.arena.get_mut(handle) {
            ev.timers.push(id);
        }
    }

    /// Stops a reception: cancels its pending timers, releases its slot and
    /// reports every contributing PPDU as dropped. The PHY state is left to
    /// the caller.
    pub(super) fn abort_reception(&mut self, handle: RxHandle, reason: DropReason, ctx: &mut SimContext) {
        if self.current == Some(handle) {
            self.current = None;
        }
        let Some(ev) = self.arena.remove(handle) else {
            return;
        };
        for timer in &ev.timers {
            ctx.cancel_event(*timer);
        }
        for contribution in &ev.contributions {
            self.notify_drop(&contribution.ppdu, reason, contribution.rx_power_dbm, ctx);
        }
    }
}
