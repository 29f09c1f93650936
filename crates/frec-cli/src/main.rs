use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use frec_hw::{Camera, FrameSource};
use frec_proto::{
    CaptureRequest, Client, DeletePersonRequest, MessageType, Response, Settings, StreamRecord,
};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SOCKET: &str = "/tmp/face_recognition.sock";

#[derive(Parser)]
#[command(name = "frec", about = "frec face recognition CLI")]
struct Cli {
    /// Control socket of the daemon
    #[arg(long, env = "FREC_SOCKET_PATH", default_value = DEFAULT_SOCKET, global = true)]
    socket: PathBuf,

    /// Seconds to wait for a reply (0 waits forever)
    #[arg(long, default_value_t = 30, global = true)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the camera
    CameraOn,
    /// Stop the camera
    CameraOff,
    /// Capture the current frame and enroll it as <INITIAL><ID>
    Capture {
        /// Person initial, e.g. "A"
        initial: String,
        /// Numeric person id
        id: u64,
    },
    /// Retrain from the dataset directory
    Train,
    /// Show daemon status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// List enrolled people
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a person and everything enrolled for them
    Delete {
        /// Person name as shown by `list`
        name: String,
    },
    /// Follow live recognition results
    Stream,
    /// Show recognition settings
    Settings {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change recognition settings
    SetSettings {
        /// Minimum similarity for a match (0-1)
        #[arg(long)]
        threshold: f32,
        /// Minimum time between recognition passes
        #[arg(long)]
        interval_ms: u32,
        /// Add captured faces to the live index immediately
        #[arg(long)]
        auto_train: bool,
    },
    /// Send a raw text-protocol command, e.g. `status` or `capture:A:1`
    Raw {
        command: String,
    },
    /// List V4L2 capture devices (no daemon needed)
    Devices,
    /// Grab one frame straight from a camera and save it (no daemon needed)
    Snapshot {
        /// Device index, opened as /dev/video<N>
        #[arg(short, long, default_value_t = 0)]
        device: u32,
        #[arg(short, long, default_value = "snapshot.png")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let timeout = (cli.timeout > 0).then(|| Duration::from_secs(cli.timeout));

    match cli.command {
        Commands::CameraOn => print_reply(request(&cli.socket, timeout, MessageType::CameraOn, None)?)?,
        Commands::CameraOff => print_reply(request(&cli.socket, timeout, MessageType::CameraOff, None)?)?,
        Commands::Capture { initial, id } => {
            let mut client = connect(&cli.socket, timeout)?;
            print_reply(client.request_with(MessageType::Capture, CaptureRequest { initial, person_id: id })?)?
        }
        Commands::Train => print_reply(request(&cli.socket, timeout, MessageType::Train, None)?)?,
        Commands::Status { json } => match request(&cli.socket, timeout, MessageType::Status, None)? {
            Response::Status(status) if json => println!("{}", serde_json::to_string_pretty(&status)?),
            Response::Status(status) => {
                println!("camera:      {}", on_off(status.camera_running));
                println!("recognition: {}", on_off(status.recognition_enabled));
                println!("training:    {}", if status.training_in_progress { "in progress" } else { "idle" });
                println!("people:      {}", status.people_count);
                println!("faces:       {}", status.total_faces);
                println!("fps:         {:.1}", status.fps);
            }
            other => print_reply(other)?,
        },
        Commands::List { json } => match request(&cli.socket, timeout, MessageType::ListPersons, None)? {
            Response::PersonList(list) if json => println!("{}", serde_json::to_string_pretty(&list)?),
            Response::PersonList(list) => {
                if list.persons.is_empty() {
                    println!("No people enrolled");
                }
                for p in &list.persons {
                    let created = chrono::DateTime::from_timestamp_millis(p.created_timestamp as i64)
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_default();
                    println!("{:>4}  {:<16} {:>3} images  {created}", p.id, p.name, p.image_count);
                }
            }
            other => print_reply(other)?,
        },
        Commands::Delete { name } => {
            let mut client = connect(&cli.socket, timeout)?;
            print_reply(client.request_with(MessageType::DeletePerson, DeletePersonRequest { name })?)?
        }
        Commands::Stream => stream(&cli.socket)?,
        Commands::Settings { json } => match request(&cli.socket, timeout, MessageType::GetSettings, None)? {
            Response::Settings(s) if json => println!("{}", serde_json::to_string_pretty(&s)?),
            Response::Settings(s) => {
                println!("threshold:   {:.2}", s.similarity_threshold);
                println!("interval:    {} ms", s.recognition_interval_ms);
                println!("auto-train:  {}", on_off(s.auto_train));
            }
            other => print_reply(other)?,
        },
        Commands::SetSettings {
            threshold,
            interval_ms,
            auto_train,
        } => {
            if !(0.0..=1.0).contains(&threshold) {
                bail!("threshold must be between 0 and 1");
            }
            let settings = Settings {
                similarity_threshold: threshold,
                recognition_interval_ms: interval_ms,
                auto_train,
            };
            print_reply(request(&cli.socket, timeout, MessageType::SetSettings, Some(settings))?)?
        }
        Commands::Raw { command } => {
            let client = connect(&cli.socket, timeout)?;
            let reply = client.text(&command)?;
            println!("{reply}");
            if reply.starts_with("ERROR:") {
                std::process::exit(1);
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Snapshot { device, output } => snapshot(device, &output)?,
    }

    Ok(())
}

fn on_off(v: bool) -> &'static str {
    if v {
        "on"
    } else {
        "off"
    }
}

fn connect(socket: &PathBuf, timeout: Option<Duration>) -> Result<Client> {
    let client = Client::connect(socket).context("is frecd running?")?;
    client.set_read_timeout(timeout)?;
    tracing::debug!(timeout = ?timeout, "client ready");
    Ok(client)
}

fn request(
    socket: &PathBuf,
    timeout: Option<Duration>,
    msg_type: MessageType,
    settings: Option<Settings>,
) -> Result<Response> {
    let mut client = connect(socket, timeout)?;
    let reply = match settings {
        Some(settings) => client.request_with(msg_type, settings)?,
        None => client.request_empty(msg_type)?,
    };
    Ok(reply)
}

/// Print a success message, or fail with the daemon's error.
fn print_reply(reply: Response) -> Result<()> {
    match reply {
        Response::Error(e) => bail!("{} (code {})", e.message, e.code.code()),
        Response::Success(message) => {
            println!("{message}");
            Ok(())
        }
        other => {
            println!("{}", other.to_text());
            Ok(())
        }
    }
}

fn stream(socket: &PathBuf) -> Result<()> {
    let client = Client::connect(socket).context("is frecd running?")?;
    let (first, records) = client.open_stream()?;
    print_reply(first)?;
    for record in records {
        match record? {
            StreamRecord::Face(f) => println!(
                "{:<16} {:>5.1}%  at ({}, {}) {}x{}",
                f.name,
                f.confidence * 100.0,
                f.x,
                f.y,
                f.width,
                f.height
            ),
            StreamRecord::MultipleFaces(m) => {
                let names: Vec<String> = m.faces.iter().map(|f| format!("{} {:.0}%", f.name, f.confidence * 100.0)).collect();
                println!("{} faces: {}", m.faces.len(), names.join(", "));
            }
            StreamRecord::NoFace(_) => println!("no face"),
            StreamRecord::TrainingStarted => println!("-- training started"),
            StreamRecord::TrainingProgress(p) => println!("-- training {}/{}: {}", p.current, p.total, p.message),
            StreamRecord::TrainingCompleted(c) => {
                println!("-- training done: {} people, {} images", c.identities, c.images)
            }
            StreamRecord::TrainingFailed(msg) => println!("-- training failed: {msg}"),
            StreamRecord::CameraError(msg) => println!("-- camera error: {msg}"),
        }
    }
    Ok(())
}

fn snapshot(device: u32, output: &PathBuf) -> Result<()> {
    let mut camera = Camera::open_index(device, 640, 480)?;
    println!(
        "{}: {}x{} {:?}",
        camera.device_path,
        camera.width,
        camera.height,
        camera.pixel_format()
    );
    // The first frames after stream start are often dark while exposure settles.
    let mut frame = camera.read_frame()?;
    for _ in 0..4 {
        frame = camera.read_frame()?;
    }
    frame
        .image
        .save(output)
        .with_context(|| format!("cannot write {}", output.display()))?;
    println!("saved {} (avg brightness {:.1})", output.display(), frame.avg_brightness());
    Ok(())
}
