use rovercore::command::COMMAND_QUEUE_CAPACITY;
use rovercore::*;

fn tank(duty: u16) -> TankCommand {
    TankCommand::power(true, duty, true, duty)
}

#[test]
fn test_queue_holds_capacity_then_fails() {
    let mut processor: CommandProcessor<4> = CommandProcessor::new();
    for duty in 1..=4 {
        assert!(processor.enqueue(tank(duty)).is_ok());
    }
    assert!(processor.is_full());
    assert_eq!(processor.enqueue(tank(5)), Err(CommandError::QueueFull));
}

#[test]
fn test_dequeue_is_fifo_then_fails_when_empty() {
    let mut processor: CommandProcessor<4> = CommandProcessor::new();
    for duty in 1..=4 {
        processor.enqueue(tank(duty)).unwrap();
    }
    for duty in 1..=4 {
        assert_eq!(processor.dequeue(), Ok(tank(duty)));
    }
    assert_eq!(processor.dequeue(), Err(CommandError::QueueEmpty));
}

#[test]
fn test_default_capacity() {
    let processor: CommandProcessor = CommandProcessor::default();
    assert_eq!(processor.capacity(), COMMAND_QUEUE_CAPACITY);
    assert!(processor.is_empty());
}

#[test]
fn test_motion_is_queued_and_immediate_commands_are_not() {
    let mut sim = Simulation::new(SimConfig::default());
    sim.submit(RoverCommand::Tank(TankCommand::power(true, 200, true, 200)))
        .unwrap();
    assert_eq!(sim.agent().processor().len(), 1);
    assert_eq!(sim.agent().rover().left().duty(), 0);

    // The next poll applies it
    sim.step();
    assert!(sim.agent().processor().is_empty());
    assert_eq!(sim.agent().rover().left().duty(), 200);

    sim.submit(RoverCommand::Halt).unwrap();
    assert!(sim.agent().processor().is_empty());
    assert_eq!(sim.agent().rover().left().duty(), 0);
}

#[test]
fn test_full_queue_rejects_through_agent() {
    let mut sim = Simulation::new(SimConfig::default());
    for _ in 0..COMMAND_QUEUE_CAPACITY {
        sim.submit(RoverCommand::Tank(TankCommand::speed(0.2, 0.2))).unwrap();
    }
    let result = sim.submit(RoverCommand::Tank(TankCommand::speed(0.2, 0.2)));
    assert_eq!(result, Err(CommandError::QueueFull));

    let state = sim.agent().state();
    assert_eq!(state.last_error, Some(CommandError::QueueFull));
    assert_eq!(sim.agent().processor().stats().rejected, 1);
}

#[test]
fn test_one_motion_command_per_poll() {
    let mut sim = Simulation::new(SimConfig::default());
    sim.submit(RoverCommand::Tank(TankCommand::power(true, 150, true, 150))).unwrap();
    sim.submit(RoverCommand::Tank(TankCommand::power(true, 220, true, 220))).unwrap();

    assert!(sim.step());
    assert_eq!(sim.agent().rover().left().duty(), 150);
    assert!(sim.step());
    assert_eq!(sim.agent().rover().left().duty(), 220);
    assert!(!sim.step());
}

#[test]
fn test_pid_command_tunes_selected_wheels() {
    let mut sim = Simulation::new(SimConfig::default());
    sim.submit(RoverCommand::Pid(PidCommand {
        wheels: WheelMask::Left,
        min_speed: 0.05,
        max_speed: 0.5,
        kp: 10.0,
        ki: 20.0,
        kd: 0.0,
    }))
    .unwrap();

    let rover = sim.agent().rover();
    assert_eq!(rover.left().config().max_speed, 0.5);
    assert_eq!(rover.right().config().max_speed, SimConfig::default().wheel.max_speed);
}

#[test]
fn test_stall_command_sets_duty_fraction() {
    let mut sim = Simulation::new(SimConfig::default());
    sim.submit(RoverCommand::Stall { left: 0.4, right: 0.6 }).unwrap();

    let rover = sim.agent().rover();
    assert_eq!(rover.left().stall_duty(), 102);
    assert_eq!(rover.right().stall_duty(), 153);
}

#[test]
fn test_noop_executes_without_side_effects() {
    let mut sim = Simulation::new(SimConfig::default());
    sim.submit(RoverCommand::Noop).unwrap();
    let stats = sim.agent().processor().stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.executed, 1);
    assert_eq!(stats.queued, 0);
}

#[test]
fn test_halt_discards_queued_motion() {
    let mut sim = Simulation::new(SimConfig::default());
    sim.submit(RoverCommand::Tank(TankCommand::power(true, 200, true, 200))).unwrap();
    sim.submit(RoverCommand::Tank(TankCommand::power(true, 220, true, 220))).unwrap();
    sim.submit(RoverCommand::Halt).unwrap();
    assert!(sim.agent().processor().is_empty());

    sim.run_for(10);
    assert_eq!(sim.agent().rover().left().duty(), 0);
    assert_eq!(sim.agent().rover().right().duty(), 0);
}

#[test]
fn test_goto_discards_queued_motion() {
    let mut sim = Simulation::new(SimConfig::default());
    sim.submit(RoverCommand::Tank(TankCommand::power(true, 200, true, 200))).unwrap();
    sim.submit(RoverCommand::Goto(GotoCommand {
        x: 1.0,
        y: 0.0,
        tolerance: 0.05,
        point_forward: 0.5,
    }))
    .unwrap();
    assert!(sim.agent().processor().is_empty());

    sim.run_for(10);
    assert!(sim.agent().behavior().is_running());
}

#[test]
fn test_reset_pose_keeps_queued_motion() {
    let mut sim = Simulation::new(SimConfig::default());
    sim.submit(RoverCommand::Tank(TankCommand::power(true, 200, true, 200))).unwrap();
    sim.submit(RoverCommand::ResetPose).unwrap();
    assert_eq!(sim.agent().processor().len(), 1);

    sim.step();
    assert_eq!(sim.agent().rover().left().duty(), 200);
}
