//! Rover orchestration.
//!
//! Wires the serial link, the NMEA fix tracker and the NTRIP client together
//! and runs the single event loop: RTCM frames from the caster go to the
//! receiver in arrival order, NMEA lines from the receiver advance the fix,
//! and with `mountpoint = auto` the first valid fix triggers source-table
//! lookup and subscription to the closest mount point.

use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::config::{RoverConfig, AUTO};
use crate::error::{Result, RoverError};
use crate::gnss::{self, GpsFix};
use crate::ntrip::NtripClient;
use crate::output::OutputHandler;
use crate::rtcm::RtcmFrame;
use crate::serial::SerialLink;

pub struct Rover {
    fix: GpsFix,
    serial: SerialLink,
    ntrip: NtripClient,
    output: OutputHandler,
    subscribed: bool,
    nmea_rx: mpsc::UnboundedReceiver<String>,
    rtcm_rx: mpsc::UnboundedReceiver<RtcmFrame>,
    rtcm_tx: mpsc::UnboundedSender<RtcmFrame>,
    stopped: bool,
}

impl Rover {
    /// Bring up all services.  Fails on the startup-critical errors: serial
    /// open and, for a fixed mount point, the NTRIP handshake.
    pub async fn start(cfg: RoverConfig) -> Result<Rover> {
        info!("Starting services");

        let mut serial = SerialLink::open(&cfg.serial_port, cfg.serial_baud)?;
        match serial.query_version() {
            Ok(Some(version)) => info!("Serial: receiver {version}"),
            Ok(None) => warn!("Serial: no MON-VER reply from the receiver"),
            Err(e) => warn!("Serial: version query failed: {e}"),
        }
        if let Err(e) = serial.set_rate(cfg.gps_rate) {
            warn!("Serial: cannot set the measurement rate: {e}");
        }

        let (nmea_tx, nmea_rx) = mpsc::unbounded_channel();
        serial.spawn_reader(nmea_tx)?;

        let output = OutputHandler::bind(&cfg).await;

        let mut ntrip = NtripClient::new(
            cfg.ntrip_host.clone(),
            cfg.ntrip_port,
            cfg.username.clone(),
            cfg.password.clone(),
        );
        let (rtcm_tx, rtcm_rx) = mpsc::unbounded_channel();
        let subscribed = if cfg.mountpoint == AUTO {
            info!("Waiting for a GPS fix to select a mount point");
            false
        } else {
            ntrip.start(&cfg.mountpoint, rtcm_tx.clone()).await?;
            true
        };

        info!("Services started");
        Ok(Rover {
            fix: GpsFix::default(),
            serial,
            ntrip,
            output,
            subscribed,
            nmea_rx,
            rtcm_rx,
            rtcm_tx,
            stopped: false,
        })
    }

    /// Event loop; returns on Ctrl-C or a fatal runtime error.
    pub async fn run(&mut self) -> Result<()> {
        let result = loop {
            tokio::select! {
                line = self.nmea_rx.recv() => match line {
                    Some(line) => self.on_nmea(&line).await,
                    None => {
                        break Err(RoverError::Serial(format!(
                            "reader on {} stopped",
                            self.serial.path()
                        )));
                    }
                },
                frame = self.rtcm_rx.recv() => {
                    // Never `None`: the rover holds a sender for resubscription.
                    if let Some(frame) = frame {
                        if let Err(e) = self.serial.write_rtcm(frame.as_bytes()) {
                            break Err(RoverError::Serial(format!(
                                "write to {} failed: {e}",
                                self.serial.path()
                            )));
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    break Ok(());
                }
            }
        };
        self.shutdown();
        result
    }

    async fn on_nmea(&mut self, line: &str) {
        let acquired = self.fix.ingest(line);
        self.output.process(line);

        if acquired {
            info!(
                "GPS fix acquired ({}): {:.6} / {:.6}",
                gnss::quality_name(self.fix.fix_quality),
                self.fix.latitude,
                self.fix.longitude
            );
            if !self.subscribed {
                self.select_and_subscribe().await;
            }
        }
    }

    /// Auto mount-point flow: source-table lookup, then subscription.  On
    /// failure the rover stays idle until the next fix-acquisition event.
    async fn select_and_subscribe(&mut self) {
        let mountpoint = match self
            .ntrip
            .find_closest_mountpoint(self.fix.latitude, self.fix.longitude)
            .await
        {
            Ok(mountpoint) => mountpoint,
            Err(e) => {
                error!("{e}");
                return;
            }
        };
        info!("Using mount point: {mountpoint}");
        match self.ntrip.start(&mountpoint, self.rtcm_tx.clone()).await {
            Ok(()) => self.subscribed = true,
            Err(e) => error!("{e}"),
        }
    }

    /// Stop all services.  Idempotent; `run` calls it on every exit path.
    fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("Stopping services");
        self.ntrip.stop();
        self.output.flush();
        info!("Services stopped");
    }
}
